//! Opaque key/value settings handed to plugins, and the connection descriptor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{TransferError, TransferResult};

/// Backend-specific settings. The core never interprets them; each plugin
/// validates its own keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginSettings(BTreeMap<String, String>);

impl PluginSettings {
    /// Empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Optional value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Required, non-empty value.
    pub fn require(&self, plugin: &str, key: &str) -> TransferResult<&str> {
        match self.get(key) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(TransferError::InvalidSettings {
                plugin: plugin.to_string(),
                reason: format!("missing required setting '{key}'"),
            }),
        }
    }

    /// Fail on any key outside `allowed`.
    pub fn reject_unknown(&self, plugin: &str, allowed: &[&str]) -> TransferResult<()> {
        if let Some(key) = self.0.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(TransferError::InvalidSettings {
                plugin: plugin.to_string(),
                reason: format!("unknown setting '{key}'"),
            });
        }
        Ok(())
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no settings are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PluginSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A `{type, settings}` pair selecting and configuring a storage plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Plugin id, e.g. `local`.
    #[serde(rename = "type")]
    pub plugin: String,
    /// Plugin-specific settings.
    #[serde(default)]
    pub settings: PluginSettings,
}

impl ConnectionConfig {
    /// Create a connection descriptor.
    pub fn new(plugin: impl Into<String>, settings: PluginSettings) -> Self {
        Self {
            plugin: plugin.into(),
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_missing_and_blank() {
        let s = PluginSettings::new().with("path", "  ");
        assert!(matches!(
            s.require("local", "path"),
            Err(TransferError::InvalidSettings { .. })
        ));
        assert!(s.require("local", "other").is_err());
    }

    #[test]
    fn test_reject_unknown() {
        let s = PluginSettings::new().with("path", "/r").with("bucket", "b");
        assert!(s.reject_unknown("local", &["path", "bucket"]).is_ok());
        let err = s.reject_unknown("local", &["path"]).unwrap_err();
        assert!(format!("{err}").contains("bucket"));
    }

    #[test]
    fn test_connection_config_json_shape() {
        let json = r#"{"type":"local","settings":{"path":"/tmp/repo","x-opaque":"{\"a\":1}"}}"#;
        let cfg: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.plugin, "local");
        assert_eq!(cfg.settings.get("path"), Some("/tmp/repo"));
        assert_eq!(cfg.settings.get("x-opaque"), Some("{\"a\":1}"));
        let back = serde_json::to_string(&cfg).unwrap();
        assert_eq!(serde_json::from_str::<ConnectionConfig>(&back).unwrap(), cfg);
    }

    #[test]
    fn test_missing_settings_default_to_empty() {
        let cfg: ConnectionConfig = serde_json::from_str(r#"{"type":"dummy"}"#).unwrap();
        assert!(cfg.settings.is_empty());
    }
}
