//! On-disk package source configuration
//!
//! Sources are one-TOML-file-per-source: distribution-shipped sources live in
//! a read-only system directory, operator-added sources in a writable user
//! directory. A user source may not shadow or delete a system source.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use super::ResolverError;

/// How a source's url is interpreted by the installer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    #[default]
    #[serde(rename = "yum-baseurl")]
    YumBaseurl,
    #[serde(rename = "yum-metalink")]
    YumMetalink,
    #[serde(rename = "yum-mirrorlist")]
    YumMirrorlist,
}

/// A package repository definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default = "default_true")]
    pub check_ssl: bool,
    #[serde(default)]
    pub check_gpg: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpgkey_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sslcacert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sslclientcert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sslclientkey: Option<String>,
    /// System sources are shipped with the distribution and are immutable.
    #[serde(default)]
    pub system: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Source {
    fn default() -> Self {
        Self {
            name: String::new(),
            source_type: SourceType::default(),
            url: String::new(),
            proxy: None,
            check_ssl: true,
            check_gpg: false,
            gpgkey_urls: Vec::new(),
            sslcacert: None,
            sslclientcert: None,
            sslclientkey: None,
            system: false,
            enabled: true,
        }
    }
}

impl Source {
    /// Validate the source url. Only schemes the installer can actually
    /// fetch from are accepted.
    pub fn validate(&self) -> Result<(), ResolverError> {
        let parsed = Url::parse(&self.url).map_err(|e| ResolverError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match parsed.scheme() {
            "http" | "https" | "file" => Ok(()),
            other => Err(ResolverError::InvalidUrl {
                url: self.url.clone(),
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }

    /// The local metadata directory for `file://` sources.
    pub fn local_path(&self) -> Option<PathBuf> {
        let parsed = Url::parse(&self.url).ok()?;
        if parsed.scheme() == "file" {
            parsed.to_file_path().ok()
        } else {
            None
        }
    }
}

/// The pair of source directories making up the configured universe.
#[derive(Debug, Clone)]
pub struct SourceStore {
    system_dir: PathBuf,
    user_dir: PathBuf,
}

impl SourceStore {
    pub fn new(system_dir: PathBuf, user_dir: PathBuf) -> Self {
        Self { system_dir, user_dir }
    }

    fn read_dir_sources(dir: &Path, system: bool) -> Result<Vec<Source>, ResolverError> {
        let mut sources = Vec::new();
        if !dir.is_dir() {
            return Ok(sources);
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "toml").unwrap_or(false))
            .collect();
        entries.sort();
        for path in entries {
            let text = fs::read_to_string(&path)?;
            let mut source: Source = toml::from_str(&text)?;
            if system {
                source.system = true;
            }
            sources.push(source);
        }
        Ok(sources)
    }

    /// All configured sources, system first, each set sorted by file name.
    pub fn all(&self) -> Result<Vec<Source>, ResolverError> {
        let mut sources = Self::read_dir_sources(&self.system_dir, true)?;
        // A user file may not shadow a system source.
        let user = Self::read_dir_sources(&self.user_dir, false)?;
        for s in user {
            if !sources.iter().any(|sys| sys.name == s.name) {
                sources.push(s);
            }
        }
        Ok(sources)
    }

    /// The enabled sources in reference order.
    pub fn enabled(&self) -> Result<Vec<Source>, ResolverError> {
        Ok(self.all()?.into_iter().filter(|s| s.enabled).collect())
    }

    /// Source names, sorted.
    pub fn list(&self) -> Result<Vec<String>, ResolverError> {
        let mut names: Vec<String> = self.all()?.into_iter().map(|s| s.name).collect();
        names.sort();
        Ok(names)
    }

    pub fn get(&self, name: &str) -> Result<Source, ResolverError> {
        self.all()?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ResolverError::UnknownSource(name.to_string()))
    }

    /// Add or replace a user source. Validation happens before anything is
    /// written; a source that fails validation is not persisted.
    pub fn add(&self, source: &Source) -> Result<(), ResolverError> {
        source.validate()?;
        if self
            .all()?
            .iter()
            .any(|s| s.system && s.name == source.name)
        {
            return Err(ResolverError::SystemSource(source.name.clone()));
        }
        fs::create_dir_all(&self.user_dir)?;
        let path = self.user_dir.join(format!("{}.toml", source.name));
        fs::write(path, toml::to_string_pretty(source)?)?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), ResolverError> {
        if self.all()?.iter().any(|s| s.system && s.name == name) {
            return Err(ResolverError::SystemSource(name.to_string()));
        }
        let path = self.user_dir.join(format!("{name}.toml"));
        if !path.exists() {
            return Err(ResolverError::UnknownSource(name.to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }
}
