//! TOML-based application configuration.
//!
//! Stores:
//! - Remote CRM endpoints, OAuth client credentials and retry policy
//! - Sync behaviour (platform tag, coalescing window, re-queue limits)
//! - Migration batch sizing
//! - Operator alert delivery
//! - Per record type object names, external id fields and eligibility rules
//!
//! Configuration is stored at `~/.config/fieldbridge/config.toml`.
//! `FIELDBRIDGE_CLIENT_ID` / `FIELDBRIDGE_CLIENT_SECRET` override the file
//! through [`Config::with_env_overrides`]; loading and saving only ever see
//! file values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::error::ConfigError;

/// Remote CRM connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scope: Option<String>,
    /// Bounded wait per HTTP call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Sync pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Remote field that receives the source platform tag.
    #[serde(default = "default_platform_field")]
    pub platform_field: String,
    #[serde(default = "default_platform_tag")]
    pub platform_tag: String,
    /// Triggers for one record inside this window collapse into one sync.
    #[serde(default = "default_coalesce_window_secs")]
    pub coalesce_window_secs: u64,
    /// Times a transiently failing record is re-queued before it is marked failed.
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    #[serde(default = "default_requeue_base_secs")]
    pub requeue_base_secs: u64,
}

/// Batch migration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Pause between records, to stay under the remote rate limit.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

/// Where the CLI reads exported records from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub records_path: Option<String>,
}

/// Where operator alerts go besides the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// JSON alerts are POSTed here when set.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_alert_timeout_secs")]
    pub timeout_secs: u64,
}

/// How one local record type maps onto a remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordTypeConfig {
    pub remote_object_name: String,
    pub external_id_field: String,
    #[serde(default = "default_publish_statuses")]
    pub publish_statuses: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Fields whose change triggers a sync. Empty means every mapped field.
    #[serde(default)]
    pub tracked_fields: Vec<String>,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/fieldbridge/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default = "default_record_types")]
    pub record_types: BTreeMap<String, RecordTypeConfig>,
}

// Default functions
fn default_base_url() -> String {
    "https://crm.example.com/api/v1".into()
}
fn default_token_url() -> String {
    "https://crm.example.com/oauth/token".into()
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_platform_field() -> String {
    "Source_Platform__c".into()
}
fn default_platform_tag() -> String {
    "cms".into()
}
fn default_coalesce_window_secs() -> u64 {
    3
}
fn default_max_requeues() -> u32 {
    5
}
fn default_requeue_base_secs() -> u64 {
    30
}
fn default_page_size() -> usize {
    50
}
fn default_delay_ms() -> u64 {
    250
}
fn default_alert_timeout_secs() -> u64 {
    10
}
fn default_publish_statuses() -> Vec<String> {
    vec!["publish".into()]
}
fn default_record_types() -> BTreeMap<String, RecordTypeConfig> {
    let mut types = BTreeMap::new();
    types.insert(
        "post".to_string(),
        RecordTypeConfig {
            remote_object_name: "Listing__c".into(),
            external_id_field: "CMS_Record_Id__c".into(),
            publish_statuses: default_publish_statuses(),
            required_fields: vec!["post_title".into()],
            tracked_fields: Vec::new(),
        },
    );
    types
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_url: default_token_url(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: None,
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            platform_field: default_platform_field(),
            platform_tag: default_platform_tag(),
            coalesce_window_secs: default_coalesce_window_secs(),
            max_requeues: default_max_requeues(),
            requeue_base_secs: default_requeue_base_secs(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_alert_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            sync: SyncSettings::default(),
            migration: MigrationConfig::default(),
            source: SourceConfig::default(),
            alert: AlertConfig::default(),
            record_types: default_record_types(),
        }
    }
}

impl RemoteConfig {
    pub fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::InvalidValue {
            key: key.to_string(),
            message: "unknown config key".to_string(),
        };
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() || key.is_empty() {
            return Err(ConfigError::MissingKey("config key is empty".into()));
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        if let Ok(n) = value.parse::<u64>() {
                            serde_json::Value::Number(n.into())
                        } else {
                            return Err(invalid(format!("cannot parse '{value}' as number")));
                        }
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    /// Default location of the config file.
    ///
    /// # Errors
    /// Returns an error if the data directory cannot be created.
    pub fn path() -> Result<PathBuf, ConfigError> {
        data_dir()
            .map(|dir| dir.join("config.toml"))
            .map_err(|e| ConfigError::LoadFailed {
                path: PathBuf::from("config.toml"),
                message: e.to_string(),
            })
    }

    /// Load from the default location, writing defaults if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from an explicit path, writing defaults if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if the
    /// default config cannot be written.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let cfg = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str::<Config>(&content).map_err(|e| {
                ConfigError::LoadFailed {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                cfg
            }
            Err(e) => {
                return Err(ConfigError::LoadFailed {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };
        Ok(cfg)
    }

    /// Persist to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    /// Persist to an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Runtime view with client credentials taken from the environment.
    /// Never save the result.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(id) = lookup("FIELDBRIDGE_CLIENT_ID") {
            self.remote.client_id = id;
        }
        if let Some(secret) = lookup("FIELDBRIDGE_CLIENT_SECRET") {
            self.remote.client_secret = secret;
        }
        self
    }

    /// Check values that would otherwise fail deep inside a sync.
    ///
    /// # Errors
    /// Returns the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("remote.base_url", &self.remote.base_url),
            ("remote.token_url", &self.remote.token_url),
        ] {
            url::Url::parse(value).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        }
        if let Some(webhook) = &self.alert.webhook_url {
            url::Url::parse(webhook).map_err(|e| ConfigError::InvalidValue {
                key: "alert.webhook_url".into(),
                message: e.to_string(),
            })?;
        }
        if self.remote.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "remote.max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.migration.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "migration.page_size".into(),
                message: "must be at least 1".into(),
            });
        }
        for (name, rt) in &self.record_types {
            if rt.remote_object_name.is_empty() || rt.external_id_field.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("record_types.{name}"),
                    message: "remote_object_name and external_id_field are required".into(),
                });
            }
        }
        Ok(())
    }

    /// Settings for a record type.
    ///
    /// # Errors
    /// Returns an error if the record type is not configured.
    pub fn record_type(&self, name: &str) -> Result<&RecordTypeConfig, ConfigError> {
        self.record_types
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRecordType(name.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key. Does not persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value cannot be parsed.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };
        let mut json = serde_json::to_value(&*self).map_err(|e| invalid(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        *self = serde_json::from_value(json).map_err(|e| invalid(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_gets_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [remote]
            client_id = "abc"

            [record_types.listing]
            remote_object_name = "Listing__c"
            external_id_field = "Ext_Id__c"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.remote.client_id, "abc");
        assert_eq!(parsed.remote.max_attempts, 3);
        assert_eq!(parsed.sync.coalesce_window_secs, 3);
        let listing = parsed.record_type("listing").unwrap();
        assert_eq!(listing.publish_statuses, vec!["publish".to_string()]);
        assert!(parsed.record_type("post").is_err());
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = Config::default();
        assert_eq!(cfg.get("remote.max_attempts").as_deref(), Some("3"));
        assert_eq!(cfg.get("sync.platform_tag").as_deref(), Some("cms"));
        assert_eq!(
            cfg.get("record_types.post.remote_object_name").as_deref(),
            Some("Listing__c")
        );
        assert!(cfg.get("remote.missing_key").is_none());
    }

    #[test]
    fn set_updates_nested_values() {
        let mut cfg = Config::default();
        cfg.set("remote.client_id", "client-1").unwrap();
        cfg.set("migration.delay_ms", "1000").unwrap();
        cfg.set("record_types.post.required_fields", r#"["post_title","quantity"]"#)
            .unwrap();
        assert_eq!(cfg.remote.client_id, "client-1");
        assert_eq!(cfg.migration.delay_ms, 1000);
        assert_eq!(cfg.record_types["post"].required_fields.len(), 2);
    }

    #[test]
    fn set_rejects_unknown_key_and_bad_type() {
        let mut cfg = Config::default();
        assert!(cfg.set("remote.nonexistent", "x").is_err());
        assert!(cfg.set("remote.max_attempts", "many").is_err());
        assert!(cfg.set("", "x").is_err());
    }

    #[test]
    fn validate_rejects_bad_urls_and_limits() {
        let mut cfg = Config::default();
        assert!(cfg.validate().is_ok());

        cfg.remote.base_url = "not a url".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "remote.base_url"
        ));

        let mut cfg = Config::default();
        cfg.remote.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_from_missing_file_writes_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.migration.page_size, 50);

        let mut changed = cfg.clone();
        changed.sync.platform_tag = "wordpress".into();
        changed.save_to(&path).unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.sync.platform_tag, "wordpress");
    }

    #[test]
    fn env_overrides_stay_out_of_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = Config::load_from(&path).unwrap();
        cfg.remote.client_id = "from-file".into();
        cfg.save_to(&path).unwrap();

        let runtime = Config::load_from(&path).unwrap().with_overrides_from(|key| match key {
            "FIELDBRIDGE_CLIENT_SECRET" => Some("from-env".into()),
            _ => None,
        });
        assert_eq!(runtime.remote.client_id, "from-file");
        assert_eq!(runtime.remote.client_secret, "from-env");
        assert!(runtime.remote.has_credentials());

        let mut edited = Config::load_from(&path).unwrap();
        edited.set("sync.coalesce_window_secs", "5").unwrap();
        edited.save_to(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("from-env"));
        assert_eq!(Config::load_from(&path).unwrap().remote.client_secret, "");
    }

    #[test]
    fn alert_webhook_is_validated() {
        let mut cfg = Config::default();
        cfg.set("alert.webhook_url", "https://hooks.example.com/fieldbridge").unwrap();
        assert!(cfg.validate().is_ok());

        cfg.alert.webhook_url = Some("nope".into());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "alert.webhook_url"
        ));
    }
}
