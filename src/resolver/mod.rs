//! Dependency resolver facade
//!
//! The service keeps a single long-lived package-database handle. Two
//! concerns dominate its design: metadata freshness (the handle re-opens the
//! underlying database once its metadata is older than `expire`) and mutual
//! exclusion (exactly one operation may hold the handle at a time; the
//! process-wide resolver lock wraps `ResolverHandle` in a `Mutex`).
//!
//! Build starts use [`ResolverHandle::refresh`] before resolving so that a
//! build's resolution reflects repository state as of its enqueue time. The
//! handle is never released between the re-open and the dependent resolve;
//! both happen under one `&mut self` call chain.

pub mod backend;
pub mod sources;

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use backend::PackageDb;
pub use backend::{GroupMeta, PackageMeta, ProjectInfo};
pub use sources::{Source, SourceStore, SourceType};

/// Resolver errors, including the client-facing resolution failures.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Resolution conflicts and missing packages, with a human-readable
    /// explanation of what could not be satisfied.
    #[error("{0}")]
    Projects(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("{0} is a system source, it cannot be changed or deleted")]
    SystemSource(String),

    #[error("Invalid source url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// A fully-qualified resolved package: name, epoch, version, release, arch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageNEVRA {
    pub name: String,
    pub epoch: u64,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl PackageNEVRA {
    /// The kickstart package line: `name-epoch:version-release.arch`, with
    /// the epoch omitted when it is zero.
    pub fn nevra(&self) -> String {
        if self.epoch == 0 {
            format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch)
        } else {
            format!(
                "{}-{}:{}-{}.{}",
                self.name, self.epoch, self.version, self.release, self.arch
            )
        }
    }

    /// The frozen-blueprint version string: `epoch:version-release.arch`.
    pub fn frozen_version(&self) -> String {
        format!(
            "{}:{}-{}.{}",
            self.epoch, self.version, self.release, self.arch
        )
    }
}

impl fmt::Display for PackageNEVRA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nevra())
    }
}

/// The shared, expirable package-database handle.
pub struct ResolverHandle {
    sources: SourceStore,
    db: PackageDb,
    expire: Duration,
    last_refresh: Instant,
    /// Set by source mutations; forces a re-open on the next acquire.
    dirty: bool,
}

impl ResolverHandle {
    /// Open the database against the configured source universe.
    pub fn open(sources: SourceStore, expire: Duration) -> Result<Self, ResolverError> {
        let db = PackageDb::open(&sources)?;
        Ok(Self {
            sources,
            db,
            expire,
            last_refresh: Instant::now(),
            dirty: false,
        })
    }

    /// Re-open the database, re-reading repository metadata.
    pub fn refresh(&mut self) -> Result<(), ResolverError> {
        debug!("refreshing package metadata");
        self.db = PackageDb::open(&self.sources)?;
        self.last_refresh = Instant::now();
        self.dirty = false;
        Ok(())
    }

    /// Re-open if the metadata is expired or a source mutation marked the
    /// handle dirty. Every operation calls this before touching the db.
    fn check_expired(&mut self) -> Result<(), ResolverError> {
        if self.dirty || self.last_refresh.elapsed() >= self.expire {
            self.refresh()?;
        }
        Ok(())
    }

    /// Transitively resolve `projects` plus `groups` into concrete packages.
    ///
    /// Returns the total installed size in bytes and the resolved set,
    /// deterministically ordered by case-insensitive name.
    pub fn depsolve(
        &mut self,
        projects: &[(String, String)],
        groups: &[String],
        with_core: bool,
    ) -> Result<(u64, Vec<PackageNEVRA>), ResolverError> {
        self.check_expired()?;
        self.db.depsolve(projects, groups, with_core)
    }

    /// List available project names, paginated, with an authoritative total.
    pub fn list_projects(
        &mut self,
        pattern: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(usize, Vec<ProjectInfo>), ResolverError> {
        self.check_expired()?;
        self.db.list_projects(pattern, limit, offset)
    }

    /// Detailed info for the named projects.
    pub fn project_info(&mut self, names: &[String]) -> Result<Vec<ProjectInfo>, ResolverError> {
        self.check_expired()?;
        self.db.project_info(names)
    }

    /// Names of the sources currently configured, system sources included.
    pub fn sources_list(&mut self) -> Result<Vec<String>, ResolverError> {
        self.sources.list()
    }

    /// Source definitions for the given names.
    pub fn sources_info(&mut self, names: &[String]) -> Result<Vec<Source>, ResolverError> {
        names.iter().map(|n| self.sources.get(n)).collect()
    }

    /// Add or replace a source. The url is validated synchronously; an
    /// invalid url fails before anything is persisted. The next acquire
    /// re-opens the database against the new universe.
    pub fn source_add(&mut self, source: Source) -> Result<(), ResolverError> {
        self.sources.add(&source)?;
        info!(source = %source.name, "added package source");
        self.dirty = true;
        Ok(())
    }

    /// Delete a non-system source.
    pub fn source_delete(&mut self, name: &str) -> Result<(), ResolverError> {
        self.sources.delete(name)?;
        info!(source = %name, "deleted package source");
        self.dirty = true;
        Ok(())
    }

    /// The first enabled source plus the remaining enabled sources, in the
    /// order the final kickstart references them.
    pub fn enabled_sources(&mut self) -> Result<Vec<Source>, ResolverError> {
        self.sources.enabled()
    }

    #[cfg(test)]
    pub(crate) fn age_metadata(&mut self, age: Duration) {
        self.last_refresh = Instant::now() - age;
    }
}
