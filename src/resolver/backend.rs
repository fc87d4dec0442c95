//! File-backed package database
//!
//! Each enabled source points at a repository metadata directory containing a
//! `packages.toml` index: the available packages (name, epoch, version,
//! release, arch, requires, installed size) and the named package groups.
//! Opening the database reads every reachable index; re-opening is how the
//! handle picks up published metadata changes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::cmp::Ordering;
use std::fs;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::sources::SourceStore;
use super::{PackageNEVRA, ResolverError};

/// One available package as described by repository metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMeta {
    pub name: String,
    #[serde(default)]
    pub epoch: u64,
    pub version: String,
    pub release: String,
    pub arch: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: Option<String>,
    /// Names of packages this one needs installed.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Installed size in bytes.
    #[serde(default)]
    pub size: u64,
}

impl PackageMeta {
    pub fn nevra(&self) -> PackageNEVRA {
        PackageNEVRA {
            name: self.name.clone(),
            epoch: self.epoch,
            version: self.version.clone(),
            release: self.release.clone(),
            arch: self.arch.clone(),
        }
    }
}

/// A named package collection provided by the repository metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RepoIndex {
    #[serde(default)]
    packages: Vec<PackageMeta>,
    #[serde(default)]
    groups: Vec<GroupMeta>,
}

/// Project info returned by list/info operations: the newest build first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub summary: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    pub builds: Vec<PackageNEVRA>,
}

/// The in-memory package database built from every reachable source index.
pub struct PackageDb {
    /// name -> candidate packages, newest EVR first.
    index: HashMap<String, Vec<PackageMeta>>,
    groups: HashMap<String, GroupMeta>,
}

impl PackageDb {
    /// Read the metadata of every enabled source. Sources whose metadata is
    /// unreachable are skipped with a warning so one broken mirror does not
    /// take the whole universe down.
    pub fn open(sources: &SourceStore) -> Result<Self, ResolverError> {
        let mut index: HashMap<String, Vec<PackageMeta>> = HashMap::new();
        let mut groups = HashMap::new();

        for source in sources.enabled()? {
            let Some(path) = source.local_path() else {
                warn!(source = %source.name, url = %source.url,
                      "source metadata is not locally reachable, skipping");
                continue;
            };
            let index_path = path.join("packages.toml");
            let text = match fs::read_to_string(&index_path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(source = %source.name, path = %index_path.display(),
                          error = %e, "failed to read source metadata, skipping");
                    continue;
                }
            };
            let repo: RepoIndex = toml::from_str(&text)?;
            debug!(source = %source.name, packages = repo.packages.len(),
                   "loaded source metadata");
            for pkg in repo.packages {
                index.entry(pkg.name.clone()).or_default().push(pkg);
            }
            for group in repo.groups {
                groups.entry(group.name.clone()).or_insert(group);
            }
        }

        for candidates in index.values_mut() {
            candidates.sort_by(|a, b| compare_evr(b, a));
        }

        Ok(Self { index, groups })
    }

    /// Best (newest) candidate for `name` whose version matches `vglob`.
    fn best_match(&self, name: &str, vglob: &str) -> Option<&PackageMeta> {
        let candidates = self.index.get(name)?;
        let pattern = Pattern::new(vglob).ok();
        candidates.iter().find(|pkg| {
            if vglob == "*" {
                return true;
            }
            let Some(pattern) = &pattern else { return false };
            // Globs may target the plain version or a frozen rendering.
            pattern.matches(&pkg.version)
                || pattern.matches(&format!("{}-{}", pkg.version, pkg.release))
                || pattern.matches(&format!(
                    "{}:{}-{}",
                    pkg.epoch, pkg.version, pkg.release
                ))
                || pattern.matches(&format!(
                    "{}:{}-{}.{}",
                    pkg.epoch, pkg.version, pkg.release, pkg.arch
                ))
        })
    }

    /// Transitive resolution of `projects` and `groups` into concrete
    /// packages. See [`super::ResolverHandle::depsolve`].
    pub fn depsolve(
        &self,
        projects: &[(String, String)],
        groups: &[String],
        with_core: bool,
    ) -> Result<(u64, Vec<PackageNEVRA>), ResolverError> {
        let mut requested: VecDeque<(String, String, Option<String>)> = VecDeque::new();

        let mut group_names: Vec<&str> = groups.iter().map(|g| g.as_str()).collect();
        if with_core && self.groups.contains_key("core") && !group_names.contains(&"core") {
            group_names.push("core");
        }
        for group in group_names {
            let meta = self.groups.get(group).ok_or_else(|| {
                ResolverError::Projects(format!("group '{group}' does not exist"))
            })?;
            for pkg in &meta.packages {
                requested.push_back((pkg.clone(), "*".to_string(), None));
            }
        }
        for (name, vglob) in projects {
            requested.push_back((name.clone(), vglob.clone(), None));
        }

        let mut selected: BTreeMap<String, &PackageMeta> = BTreeMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some((name, vglob, wanted_by)) = requested.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(pkg) = self.best_match(&name, &vglob) else {
                let msg = match wanted_by {
                    Some(parent) => format!(
                        "nothing provides '{name}' required by '{parent}'"
                    ),
                    None => format!("no package matches '{name}-{vglob}'"),
                };
                return Err(ResolverError::Projects(msg));
            };
            for req in &pkg.requires {
                requested.push_back((req.clone(), "*".to_string(), Some(name.clone())));
            }
            selected.insert(name, pkg);
        }

        let installed_size = selected.values().map(|p| p.size).sum();
        let mut deps: Vec<PackageNEVRA> = selected.values().map(|p| p.nevra()).collect();
        deps.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok((installed_size, deps))
    }

    pub fn list_projects(
        &self,
        pattern: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(usize, Vec<ProjectInfo>), ResolverError> {
        let matcher = match pattern {
            Some(p) if p != "*" => Some(Pattern::new(p).map_err(|e| {
                ResolverError::Projects(format!("bad pattern '{p}': {e}"))
            })?),
            _ => None,
        };
        let mut names: Vec<&String> = self
            .index
            .keys()
            .filter(|n| matcher.as_ref().map(|m| m.matches(n)).unwrap_or(true))
            .collect();
        names.sort();
        let total = names.len();
        let page = names
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|n| self.project(n))
            .collect();
        Ok((total, page))
    }

    pub fn project_info(&self, names: &[String]) -> Result<Vec<ProjectInfo>, ResolverError> {
        names
            .iter()
            .map(|name| {
                if self.index.contains_key(name) {
                    Ok(self.project(name))
                } else {
                    Err(ResolverError::Projects(format!("unknown project '{name}'")))
                }
            })
            .collect()
    }

    fn project(&self, name: &str) -> ProjectInfo {
        let builds = &self.index[name];
        let newest = &builds[0];
        ProjectInfo {
            name: name.to_string(),
            summary: newest.summary.clone(),
            description: newest.description.clone(),
            homepage: newest.homepage.clone(),
            builds: builds.iter().map(|p| p.nevra()).collect(),
        }
    }
}

/// Compare two packages by (epoch, version, release) the way rpm does:
/// alternating numeric and alphabetic segments, numerics compared as numbers.
pub fn compare_evr(a: &PackageMeta, b: &PackageMeta) -> Ordering {
    a.epoch
        .cmp(&b.epoch)
        .then_with(|| compare_version(&a.version, &b.version))
        .then_with(|| compare_version(&a.release, &b.release))
}

fn compare_version(a: &str, b: &str) -> Ordering {
    let seg_a = segments(a);
    let seg_b = segments(b);
    for (sa, sb) in seg_a.iter().zip(seg_b.iter()) {
        let ord = match (sa, sb) {
            (Segment::Num(x), Segment::Num(y)) => x.cmp(y),
            (Segment::Alpha(x), Segment::Alpha(y)) => x.cmp(y),
            // Numeric segments sort newer than alphabetic ones.
            (Segment::Num(_), Segment::Alpha(_)) => Ordering::Greater,
            (Segment::Alpha(_), Segment::Num(_)) => Ordering::Less,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    seg_a.len().cmp(&seg_b.len())
}

#[derive(Debug, PartialEq)]
enum Segment {
    Num(u64),
    Alpha(String),
}

fn segments(version: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut chars = version.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut num = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    num.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(Segment::Num(num.parse().unwrap_or(u64::MAX)));
        } else if c.is_ascii_alphabetic() {
            let mut alpha = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphabetic() {
                    alpha.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(Segment::Alpha(alpha));
        } else {
            // Separators only delimit segments.
            chars.next();
        }
    }
    out
}
