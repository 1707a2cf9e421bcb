use serde::Deserialize;
use std::path::Path;
use url::Url;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Base URL that relative article image paths are resolved against
    #[serde(default = "default_media_url")]
    pub media_url: String,
    /// Directory served under /media
    #[serde(default = "default_media_dir")]
    pub media_dir: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_url() -> String {
    "sqlite:newsdesk.db?mode=rwc".to_string()
}

fn default_media_url() -> String {
    "http://localhost:3000/media/".to_string()
}

fn default_media_dir() -> String {
    "media".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_url: default_database_url(),
            media_url: default_media_url(),
            media_dir: default_media_dir(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load the config file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.media_base()?;
        Ok(config)
    }

    pub fn media_base(&self) -> anyhow::Result<Url> {
        let mut base = Url::parse(&self.media_url)?;
        // Url::join drops the last path segment unless the base ends with a slash
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base)
    }
}
