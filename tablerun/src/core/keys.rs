//! Key-field configuration: which fields identify an entry and in what
//! positional order key values travel on a command line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::record::{Entry, Fields};
use crate::error::ConfigError;

/// Per-field key configuration as written in `tablerun.toml`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyFieldConfig {
    /// Part of the unique identity of an entry.
    pub required: bool,
    /// Position when key values are passed as arguments (ascending).
    pub rank: i64,
}

/// Validated key fields, ordered by `rank` (ties broken by name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFields {
    ordered: Vec<(String, KeyFieldConfig)>,
}

impl KeyFields {
    pub fn new(fields: &BTreeMap<String, KeyFieldConfig>) -> Result<Self, ConfigError> {
        let mut ordered: Vec<(String, KeyFieldConfig)> = fields
            .iter()
            .map(|(name, cfg)| (name.clone(), *cfg))
            .collect();
        ordered.sort_by(|a, b| a.1.rank.cmp(&b.1.rank).then_with(|| a.0.cmp(&b.0)));
        if !ordered.iter().any(|(_, cfg)| cfg.required) {
            return Err(ConfigError::NoRequiredKeyField);
        }
        Ok(Self { ordered })
    }

    /// Key field names in rank order ("query fields").
    pub fn query_fields(&self) -> Vec<String> {
        self.ordered.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.ordered
            .iter()
            .filter(|(_, cfg)| cfg.required)
            .map(|(name, _)| name.as_str())
    }

    pub fn is_key(&self, name: &str) -> bool {
        self.ordered.iter().any(|(key, _)| key == name)
    }

    /// Check that `keys` covers every required field and names only key fields.
    pub fn validate_lookup(&self, keys: &Fields) -> Result<(), ConfigError> {
        for name in keys.keys() {
            if !self.is_key(name) {
                return Err(ConfigError::UnknownKey(name.clone()));
            }
        }
        for name in self.required() {
            match keys.get(name) {
                Some(value) if !value.is_empty() => {}
                _ => return Err(ConfigError::MissingKey(name.to_string())),
            }
        }
        Ok(())
    }

    /// Map positional values onto query fields in rank order.
    pub fn from_positional(&self, values: &[String]) -> Result<Fields, ConfigError> {
        if values.len() > self.ordered.len() {
            return Err(ConfigError::TooManyKeyValues {
                given: values.len(),
                available: self.ordered.len(),
            });
        }
        Ok(self
            .ordered
            .iter()
            .zip(values)
            .map(|((name, _), value)| (name.clone(), value.clone()))
            .collect())
    }

    /// The entry's non-empty key values, used to pin it for saving.
    pub fn identity_of(&self, entry: &Entry) -> Fields {
        self.ordered
            .iter()
            .filter_map(|(name, _)| entry.get(name).map(|value| (name, value)))
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect()
    }

    /// Positional arguments for a goal executable: the entry's key values in
    /// rank order, skipping fields that are absent or empty on the entry.
    pub fn arguments_for(&self, entry: &Entry) -> Vec<String> {
        self.ordered
            .iter()
            .filter_map(|(name, _)| entry.get(name))
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Render keys as `name=value` pairs for log and error messages.
pub fn describe_keys(keys: &Fields) -> String {
    let pairs: Vec<String> = keys
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}
