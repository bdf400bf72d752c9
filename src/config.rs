// SPDX-License-Identifier: GPL-3.0-only

//! Persistent parameter store
//!
//! Acquisition parameters survive across sessions in a flat JSON file under
//! the platform config directory. The store is deliberately dumb: it holds
//! whatever callers put in it and knows nothing about device capabilities.
//! Backends validate stored values against the live [`ParameterRegistry`]
//! during configure and call [`ParameterStore::reset`] when a device
//! rejects a value.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::params::ParamValue;

const STORE_FILE: &str = "parameters.json";

#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    values: HashMap<String, ParamValue>,
    /// None for in-memory stores
    path: Option<PathBuf>,
}

impl ParameterStore {
    /// Load the store from `<config>/scancap/parameters.json`; a missing or
    /// unreadable file yields an empty store bound to that path.
    pub fn load() -> Self {
        let path = dirs::config_dir().map(|dir| dir.join("scancap").join(STORE_FILE));

        let values = path
            .as_deref()
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|text| match serde_json::from_str(&text) {
                Ok(map) => Some(map),
                Err(err) => {
                    warn!(error = %err, "parameter store file is corrupt, starting empty");
                    None
                }
            })
            .unwrap_or_default();

        Self { values, path }
    }

    /// Store without persistence, for tests and one-shot runs
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store persisted at an explicit path
    pub fn at_path(path: PathBuf) -> Self {
        let values = fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            values,
            path: Some(path),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn get_or(&self, name: &str, default: ParamValue) -> ParamValue {
        self.values.get(name).cloned().unwrap_or(default)
    }

    /// Typed getter; falls back to `default` on absence or type mismatch
    pub fn get_f64(&self, name: &str, default: f64) -> f64 {
        self.values
            .get(name)
            .and_then(ParamValue::as_f64)
            .unwrap_or(default)
    }

    pub fn get_i64(&self, name: &str, default: i64) -> i64 {
        self.values
            .get(name)
            .and_then(ParamValue::as_i64)
            .unwrap_or(default)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.values
            .get(name)
            .and_then(ParamValue::as_bool)
            .unwrap_or(default)
    }

    pub fn get_text(&self, name: &str, default: &str) -> String {
        self.values
            .get(name)
            .and_then(|v| v.as_text())
            .unwrap_or(default)
            .to_string()
    }

    /// Update a value and persist best-effort
    pub fn set(&mut self, name: &str, value: ParamValue) {
        self.values.insert(name.to_string(), value);
        self.persist();
    }

    /// Fallback path: overwrite a stored value with its documented default
    /// after the device rejected it
    pub fn reset(&mut self, name: &str, default: ParamValue) {
        debug!(param = name, default = %default, "resetting stored parameter to default");
        self.set(name, default);
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let result = path
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| {
                let text = serde_json::to_string_pretty(&self.values)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                fs::write(path, text)
            });
        if let Err(err) = result {
            // Persistence failures never interrupt acquisition
            warn!(path = %path.display(), error = %err, "failed to persist parameter store");
        }
    }
}
