// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod registry;
mod schema;

pub use registry::{config, global, set_config, ConfigError, ConfigRegistry};
pub use schema::*;
