// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod adapter;
mod mock;
mod openai_compat;
mod preset;
mod protocol;
mod types;

pub use adapter::{call_and_collect, AdapterError, AdapterStream, ModelAdapter, StreamItem};
pub use mock::{MockAdapter, ScriptedCall, ScriptedMockAdapter};
pub use openai_compat::OpenAiCompatAdapter;
pub use preset::{ModelConfig, ModelPreset, PresetError, PresetRegistry};
pub use protocol::{global_protocols, AdapterCtor, ProtocolRegistry};
pub use types::*;
