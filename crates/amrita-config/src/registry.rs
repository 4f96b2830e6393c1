// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use crate::schema::AmritaConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration has not been installed; call set_config first")]
    NotInitialized,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Process-wide "current config" holder.
///
/// Lifecycle: constructed empty (`initialized`), becomes `ready` on the first
/// successful [`set`](Self::set), and may be replaced any number of times
/// afterwards.  Readers always get an `Arc` snapshot; a replacement never
/// mutates a config a running turn already captured.
///
/// A shared default instance is available via [`global`]; tests construct
/// their own instances to stay isolated.
#[derive(Default)]
pub struct ConfigRegistry {
    current: RwLock<Option<Arc<AmritaConfig>>>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install `cfg`, replacing any previous value.
    ///
    /// When the cookie canary is enabled with an empty marker, a random
    /// marker is generated here so every installed config is usable as-is.
    pub fn set(&self, mut cfg: AmritaConfig) -> Result<(), ConfigError> {
        cfg.validate().map_err(ConfigError::Invalid)?;
        if cfg.cookie.enable_cookie && cfg.cookie.cookie.is_empty() {
            cfg.cookie.cookie = uuid::Uuid::new_v4().simple().to_string();
            debug!("generated random cookie marker");
        }
        *self.current.write().expect("config lock poisoned") = Some(Arc::new(cfg));
        Ok(())
    }

    /// Snapshot of the current config, or `NotInitialized` before the first
    /// [`set`](Self::set).
    pub fn get(&self) -> Result<Arc<AmritaConfig>, ConfigError> {
        self.current
            .read()
            .expect("config lock poisoned")
            .clone()
            .ok_or(ConfigError::NotInitialized)
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().expect("config lock poisoned").is_some()
    }
}

/// The process-wide default registry.
pub fn global() -> &'static ConfigRegistry {
    static GLOBAL: OnceLock<ConfigRegistry> = OnceLock::new();
    GLOBAL.get_or_init(ConfigRegistry::new)
}

/// Install `cfg` into the process-wide registry.
pub fn set_config(cfg: AmritaConfig) -> Result<(), ConfigError> {
    global().set(cfg)
}

/// Snapshot of the process-wide config.
pub fn config() -> Result<Arc<AmritaConfig>, ConfigError> {
    global().get()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
