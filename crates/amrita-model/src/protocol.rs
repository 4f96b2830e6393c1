// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Protocol registry: maps preset protocol tags to adapter constructors.
//!
//! The registry holds construction logic only — static driver metadata, if
//! any, belongs to the adapters themselves.  A process-wide default instance
//! is available via [`global_protocols`]; tests construct their own.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use crate::adapter::{AdapterError, ModelAdapter};
use crate::preset::ModelPreset;

/// Constructor bound to one or more protocol tags.
pub type AdapterCtor =
    Arc<dyn Fn(&ModelPreset) -> Result<Arc<dyn ModelAdapter>, AdapterError> + Send + Sync>;

#[derive(Default)]
pub struct ProtocolRegistry {
    ctors: RwLock<HashMap<String, AdapterCtor>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `ctor` under every tag in `tags`.
    ///
    /// With `override_existing = false`, binding a tag that is already taken
    /// fails `ProtocolConflict` and no tag from this call is bound.
    pub fn register<F>(
        &self,
        tags: &[&str],
        ctor: F,
        override_existing: bool,
    ) -> Result<(), AdapterError>
    where
        F: Fn(&ModelPreset) -> Result<Arc<dyn ModelAdapter>, AdapterError>
            + Send
            + Sync
            + 'static,
    {
        let mut map = self.ctors.write().expect("protocol lock poisoned");
        if !override_existing {
            if let Some(taken) = tags.iter().find(|t| map.contains_key(**t)) {
                return Err(AdapterError::ProtocolConflict((*taken).to_string()));
            }
        }
        let ctor: AdapterCtor = Arc::new(ctor);
        for tag in tags {
            debug!(tag, "binding adapter protocol");
            map.insert((*tag).to_string(), Arc::clone(&ctor));
        }
        Ok(())
    }

    /// Construct the adapter bound to `preset.protocol`.
    pub fn resolve(&self, preset: &ModelPreset) -> Result<Arc<dyn ModelAdapter>, AdapterError> {
        let ctor = {
            let map = self.ctors.read().expect("protocol lock poisoned");
            map.get(&preset.protocol)
                .cloned()
                .ok_or_else(|| AdapterError::UnknownProtocol(preset.protocol.clone()))?
        };
        ctor(preset)
    }

    pub fn tags(&self) -> Vec<String> {
        let map = self.ctors.read().expect("protocol lock poisoned");
        let mut tags: Vec<String> = map.keys().cloned().collect();
        tags.sort();
        tags
    }
}

/// The process-wide default protocol registry.
pub fn global_protocols() -> &'static Arc<ProtocolRegistry> {
    static GLOBAL: OnceLock<Arc<ProtocolRegistry>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(ProtocolRegistry::new()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
