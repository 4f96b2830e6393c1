// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("unknown preset: {0}")]
    NotFound(String),
    #[error("no default preset is selected")]
    NoDefault,
    #[error("preset file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("preset parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_top_k() -> u32 {
    40
}

fn default_top_p() -> f32 {
    0.9
}

fn default_temperature() -> f32 {
    0.7
}

fn default_true() -> bool {
    true
}

/// Generation parameters carried by a preset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Request streamed delivery; non-streaming presets yield the terminal
    /// response only.
    #[serde(default = "default_true")]
    pub stream: bool,
    /// The model emits an explicit chain of thought before its answer.
    #[serde(default)]
    pub thought_chain_model: bool,
    #[serde(default)]
    pub multimodal: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            stream: true,
            thought_chain_model: false,
            multimodal: false,
        }
    }
}

/// A named bundle of model identity, endpoint, credentials and generation
/// parameters.  Serializes to a single round-trippable JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPreset {
    pub name: String,
    /// Model identifier forwarded to the provider API.
    pub model: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Tag resolved against the protocol registry to pick an adapter.
    pub protocol: String,
    #[serde(default)]
    pub config: ModelConfig,
    /// Provider-specific extras merged verbatim into the request body.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl ModelPreset {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            base_url: base_url.into(),
            api_key: String::new(),
            protocol: protocol.into(),
            config: ModelConfig::default(),
            extra: serde_json::Value::Null,
        }
    }
}

struct PresetState {
    presets: HashMap<String, ModelPreset>,
    default_name: Option<String>,
}

/// Keyed map of named presets plus a nullable default selection.
///
/// Writes are serialized behind the registry lock; reads return clones so a
/// running turn keeps the preset it started with even when the registry is
/// mutated underneath it.
pub struct PresetRegistry {
    state: RwLock<PresetState>,
}

impl Default for PresetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresetRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PresetState {
                presets: HashMap::new(),
                default_name: None,
            }),
        }
    }

    /// Insert `preset`, replacing any previous entry with the same name.
    pub fn add(&self, preset: ModelPreset) {
        let mut s = self.state.write().expect("preset lock poisoned");
        debug!(name = %preset.name, protocol = %preset.protocol, "registering preset");
        s.presets.insert(preset.name.clone(), preset);
    }

    /// Remove a preset.  Clears the default selection when it pointed here.
    pub fn remove(&self, name: &str) {
        let mut s = self.state.write().expect("preset lock poisoned");
        s.presets.remove(name);
        if s.default_name.as_deref() == Some(name) {
            s.default_name = None;
        }
    }

    pub fn get(&self, name: &str) -> Result<ModelPreset, PresetError> {
        self.state
            .read()
            .expect("preset lock poisoned")
            .presets
            .get(name)
            .cloned()
            .ok_or_else(|| PresetError::NotFound(name.to_string()))
    }

    /// The currently selected default preset.
    pub fn default_preset(&self) -> Result<ModelPreset, PresetError> {
        let s = self.state.read().expect("preset lock poisoned");
        let name = s.default_name.as_deref().ok_or(PresetError::NoDefault)?;
        s.presets
            .get(name)
            .cloned()
            .ok_or_else(|| PresetError::NotFound(name.to_string()))
    }

    /// Select the default preset.  The preset must already be registered.
    pub fn set_default(&self, name: &str) -> Result<(), PresetError> {
        let mut s = self.state.write().expect("preset lock poisoned");
        if !s.presets.contains_key(name) {
            return Err(PresetError::NotFound(name.to_string()));
        }
        s.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let s = self.state.read().expect("preset lock poisoned");
        let mut names: Vec<String> = s.presets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Read a single preset from a JSON file and register it.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<ModelPreset, PresetError> {
        let text = std::fs::read_to_string(path)?;
        let preset: ModelPreset = serde_json::from_str(&text)?;
        self.add(preset.clone());
        Ok(preset)
    }

    /// Write the named preset to a JSON file.
    pub fn save(&self, name: &str, path: impl AsRef<Path>) -> Result<(), PresetError> {
        let preset = self.get(name)?;
        let text = serde_json::to_string_pretty(&preset)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
