//! Service configuration
//!
//! The daemon reads a single TOML file with sections for the API socket,
//! the on-disk layout, the resolver, and the downstream builder. Missing
//! sections fall back to the defaults below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
        }
    }
}

/// On-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Build state: `results/` and `queue/{new,run}`.
    pub lib_dir: PathBuf,
    /// Read-only data shipped with the service: kickstart templates and
    /// system package sources.
    pub share_dir: PathBuf,
    /// The blueprint repository and workspace overlays.
    pub repo_dir: PathBuf,
    /// Host identity file for builder configs.
    pub os_release: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            lib_dir: PathBuf::from("/var/lib/imageforge"),
            share_dir: PathBuf::from("/usr/share/imageforge"),
            repo_dir: PathBuf::from("/var/lib/imageforge/blueprints"),
            os_release: PathBuf::from("/etc/os-release"),
        }
    }
}

/// Resolver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Package metadata is re-read once it is older than this.
    pub metadata_expire_secs: u64,
    /// Override the detected machine architecture.
    pub arch: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            metadata_expire_secs: 300,
            arch: None,
        }
    }
}

/// Downstream image builder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    /// The builder executable the worker invokes for each build.
    pub command: PathBuf,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            command: PathBuf::from("/usr/libexec/imageforge-builder"),
        }
    }
}

/// The complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub paths: PathsConfig,
    pub resolver: ResolverConfig,
    pub builder: BuilderSettings,
}

impl Config {
    /// Load configuration from `path`, or fall back to defaults when no
    /// path is given or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                let config: Config = toml::from_str(&text)?;
                config.validate()?;
                info!(path = %path.display(), "loaded configuration");
                Ok(config)
            }
            Some(path) => {
                warn!(path = %path.display(), "configuration file not found, using defaults");
                Ok(Config::default())
            }
            None => Ok(Config::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolver.metadata_expire_secs == 0 {
            return Err(ConfigError::Invalid(
                "resolver.metadata_expire_secs must be greater than zero".to_string(),
            ));
        }
        if self.api.host.is_empty() {
            return Err(ConfigError::Invalid("api.host must not be empty".to_string()));
        }
        Ok(())
    }

    /// The user-writable package source directory.
    pub fn user_sources_dir(&self) -> PathBuf {
        self.paths.repo_dir.join("sources")
    }

    /// The distribution-shipped (system) package source directory.
    pub fn system_sources_dir(&self) -> PathBuf {
        self.paths.share_dir.join("sources")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.api.port, 4000);
        assert_eq!(config.resolver.metadata_expire_secs, 300);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("imageforge.toml");
        std::fs::write(
            &path,
            "[api]\nport = 8080\n\n[paths]\nlib_dir = \"/srv/imageforge\"\n",
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.paths.lib_dir, PathBuf::from("/srv/imageforge"));
        assert_eq!(config.paths.share_dir, PathBuf::from("/usr/share/imageforge"));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/imageforge.toml"))).unwrap();
        assert_eq!(config.api.port, 4000);
    }

    #[test]
    fn zero_expiry_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("imageforge.toml");
        std::fs::write(&path, "[resolver]\nmetadata_expire_secs = 0\n").unwrap();
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Invalid(_))
        ));
    }
}
