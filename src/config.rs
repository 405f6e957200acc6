use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::storage::StorageOptions;

/// File name the setup command writes inside `<where>/<domain>/`.
pub const SERVER_CONFIG_FILE: &str = "serverconfig.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sections this crate does not interpret; kept so rewriting the file
    /// does not lose them.
    #[serde(flatten)]
    pub other: toml::Table,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: String,
    #[serde(default)]
    pub options: StorageOptions,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields an empty config.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// The `[store]` section, which every object command needs.
    pub fn store(&self) -> Result<&StoreConfig> {
        self.store
            .as_ref()
            .context("config has no [store] section; run `b2cs setup` first")
    }

    pub fn default_config() -> String {
        r#"
[store]
backend = "B2CS"

[store.options]
accountId = "your-account-id"
applicationKey = "your-application-key"
bucketName = "my-bucket"
# region = "us-west-004"                              # Optional
# endpoint = "https://s3.us-west-004.backblazeb2.com" # Optional, derived from region
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let cfg: Config = toml::from_str(&Config::default_config()).unwrap();
        let store = cfg.store().unwrap();
        assert_eq!(store.backend, "B2CS");
        assert_eq!(store.options.get("bucketName"), Some("my-bucket"));
        assert_eq!(store.options.get("region"), None);
    }

    #[test]
    fn test_save_preserves_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com").join(SERVER_CONFIG_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[server]\naddr = \":443\"\n").unwrap();

        let mut cfg = Config::load_or_default(&path).unwrap();
        cfg.store = Some(StoreConfig {
            backend: "B2CS".into(),
            options: StorageOptions::new().with("bucketName", "bkt"),
        });
        cfg.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.store, cfg.store);
        assert_eq!(reloaded.other["server"]["addr"].as_str(), Some(":443"));
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert!(cfg.store.is_none());
        assert!(cfg.store().is_err());
    }
}
