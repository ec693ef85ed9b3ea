//! Configuration loading and persistence.
//!
//! Settings live in `{config_dir}/sessionwire/config.json` and can be
//! overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `SESSIONWIRE_SERVER_URL` | `server_url` |
//! | `SESSIONWIRE_TOKEN` | `token` |
//! | `SESSIONWIRE_COOKIE` | `cookie` |
//! | `SESSIONWIRE_WINDOW` | `window` |
//! | `SESSIONWIRE_CONFIG_DIR` | config directory itself |

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth;
use crate::channel::ChannelSettings;

/// Configuration for the sessionwire client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the server (`https://...`).
    pub server_url: String,
    /// Bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Readable cookie string to discover a token from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    /// Window id namespacing the session registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    /// Default model for headless prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Working directory for sessions started by this client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            token: None,
            cookie: None,
            window: None,
            model: None,
            work_dir: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `SESSIONWIRE_CONFIG_DIR` wins; otherwise the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("SESSIONWIRE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("sessionwire"))
    }

    /// Directory holding the session registry files.
    pub fn registry_dir(dir: &Path) -> PathBuf {
        dir.join("sessions")
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from(&dir)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load `config.json` from a directory. A missing file yields defaults.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        if !path.exists() {
            log::debug!("[Config] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("SESSIONWIRE_SERVER_URL") {
            self.server_url = server_url;
        }
        if let Some(token) = lookup("SESSIONWIRE_TOKEN") {
            self.token = Some(token);
        }
        if let Some(cookie) = lookup("SESSIONWIRE_COOKIE") {
            self.cookie = Some(cookie);
        }
        if let Some(window) = lookup("SESSIONWIRE_WINDOW") {
            self.window = Some(window);
        }
    }

    /// Persists the configuration to `dir/config.json`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // May hold a token: owner read/write only.
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Token to put on connection URLs and API calls, if any.
    pub fn bearer_token(&self) -> Option<String> {
        auth::resolve_token(self.token.as_deref(), self.cookie.as_deref())
    }

    /// Channel settings for this server.
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings::new(self.server_url.clone(), self.bearer_token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            server_url: "https://example.com".to_string(),
            model: Some("sonnet".to_string()),
            ..Config::default()
        };
        config.save_to(dir.path()).unwrap();
        assert_eq!(Config::load_from(dir.path()).unwrap(), config);

        let raw = fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(!raw.contains("token"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), r#"{"window":"w1"}"#).unwrap();
        let config = Config::load_from(dir.path()).unwrap();
        assert_eq!(config.window.as_deref(), Some("w1"));
        assert_eq!(config.server_url, "http://localhost:3000");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{").unwrap();
        assert!(Config::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SESSIONWIRE_SERVER_URL", "https://override.test"),
            ("SESSIONWIRE_COOKIE", "auth_token=from-cookie"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| (*v).to_string()));
        assert_eq!(config.server_url, "https://override.test");
        assert_eq!(config.bearer_token().as_deref(), Some("from-cookie"));

        let settings = config.channel_settings();
        assert_eq!(settings.token.as_deref(), Some("from-cookie"));
        assert_eq!(settings.max_reconnect_attempts, 5);
    }
}
