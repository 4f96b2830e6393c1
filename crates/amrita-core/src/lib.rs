// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod compress;
mod error;
mod mcp;
mod memory;
mod session;
mod stream;
mod turn;

pub use compress::{compress_memory, SUMMARIZE_PROMPT};
pub use error::AmritaError;
pub use mcp::{mcp_connector, set_mcp_connector, McpClient, McpConnector, McpToolProxy};
pub use memory::MemoryModel;
pub use session::{global_sessions, SessionData, SessionRegistry};
pub use stream::ResponseQueue;
pub use turn::{ChatTurn, ChatTurnBuilder};
