//! Application configuration management.
//!
//! This module handles loading and saving the configuration needed to talk to
//! the identity service: its base URL, the app's client id and secret, and the
//! email domain used for anonymous users.
//!
//! Configuration is stored at `~/.config/docflow/config.json`. Every value can
//! be overridden through `DOCFLOW_*` environment variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config directory paths and the keychain service
pub const APP_NAME: &str = "docflow";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_USER_CENTER_URL: &str = "DOCFLOW_USER_CENTER_URL";
const ENV_CLIENT_ID: &str = "DOCFLOW_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "DOCFLOW_CLIENT_SECRET";
const ENV_EMAIL_DOMAIN: &str = "DOCFLOW_EMAIL_DOMAIN";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    pub user_center_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub email_domain: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `DOCFLOW_*` environment variables on top of the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = value(ENV_USER_CENTER_URL) {
            self.user_center_url = Some(url);
        }
        if let Some(id) = value(ENV_CLIENT_ID) {
            self.client_id = Some(id);
        }
        if let Some(secret) = value(ENV_CLIENT_SECRET) {
            self.client_secret = Some(secret);
        }
        if let Some(domain) = value(ENV_EMAIL_DOMAIN) {
            self.email_domain = Some(domain);
        }
        self
    }

    pub fn user_center_url(&self) -> Result<&str> {
        required(&self.user_center_url, "user_center_url", ENV_USER_CENTER_URL)
    }

    pub fn client_id(&self) -> Result<&str> {
        required(&self.client_id, "client_id", ENV_CLIENT_ID)
    }

    pub fn client_secret(&self) -> Result<&str> {
        required(&self.client_secret, "client_secret", ENV_CLIENT_SECRET)
    }

    pub fn email_domain(&self) -> Result<&str> {
        required(&self.email_domain, "email_domain", ENV_EMAIL_DOMAIN)
    }
}

fn required<'a>(value: &'a Option<String>, name: &str, env: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("{} is not configured (set it in config.json or {})", name, env))
}
