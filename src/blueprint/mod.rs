//! Blueprint data model
//!
//! A blueprint is a declarative description of an image: the packages,
//! modules, and groups to install plus host customizations (users, firewall,
//! locale, ...). Blueprints round-trip between TOML, JSON, and the structured
//! form in this module; unknown fields are carried through untouched so that
//! newer clients can store data older servers do not understand.

pub mod diff;

use indexmap::IndexMap;
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub use diff::{diff_blueprints, DiffEntry, DiffValue};

/// Blueprint parsing and validation errors
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid version '{0}': {1}")]
    BadVersion(String, semver::Error),

    #[error("Blueprint is missing a name")]
    MissingName,
}

/// A module or package request: a name plus a version glob.
///
/// The glob syntax is opaque here and passed through to the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageReq {
    pub name: String,
    #[serde(default = "any_version")]
    pub version: String,
}

fn any_version() -> String {
    "*".to_string()
}

/// A package group provided by the repository metadata, referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReq {
    pub name: String,
}

/// A git repository to be packaged and installed into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoGit {
    pub rpmname: String,
    pub rpmversion: String,
    pub rpmrelease: String,
    pub summary: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub destination: String,
}

/// Container for `[repos]` sub-tables. Only `git` entries are recognized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repos {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub git: Vec<RepoGit>,
}

/// `customizations.kernel`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelCustomization {
    #[serde(default)]
    pub append: String,
}

/// `customizations.timezone`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimezoneCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ntpservers: Vec<String>,
}

/// `customizations.locale`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocaleCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<String>,
}

/// `customizations.firewall.services`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallServices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<String>,
}

/// `customizations.firewall`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<FirewallServices>,
}

/// `customizations.services`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesCustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<String>,
}

/// `[[customizations.user]]` - only `name` is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCustomization {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// `[[customizations.group]]` - gid is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupCustomization {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u64>,
}

/// `[[customizations.sshkey]]` - legacy form, coexists with `user.key`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshKeyCustomization {
    pub user: String,
    pub key: String,
}

/// The optional `[customizations]` sub-document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Customizations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<TimezoneCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<LocaleCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallCustomization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<ServicesCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user: Vec<UserCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group: Vec<GroupCustomization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sshkey: Vec<SshKeyCustomization>,
    /// Unknown customization keys are preserved on write.
    #[serde(flatten)]
    pub extra: IndexMap<String, toml::Value>,
}

/// A named, semver-versioned image description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "zero_version")]
    pub version: String,
    #[serde(default)]
    pub modules: Vec<PackageReq>,
    #[serde(default)]
    pub packages: Vec<PackageReq>,
    #[serde(default)]
    pub groups: Vec<GroupReq>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "customizations_table_or_list"
    )]
    pub customizations: Option<Customizations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos: Option<Repos>,
    /// Unknown top-level keys are preserved on write.
    #[serde(flatten)]
    pub extra: IndexMap<String, toml::Value>,
}

fn zero_version() -> String {
    "0.0.1".to_string()
}

/// Accept `[customizations]` written as either a table or, leniently, as a
/// one-element array of tables (`[[customizations]]`).
fn customizations_table_or_list<'de, D>(de: D) -> Result<Option<Customizations>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TableOrList {
        Table(Customizations),
        List(Vec<Customizations>),
    }

    Ok(match Option::<TableOrList>::deserialize(de)? {
        None => None,
        Some(TableOrList::Table(c)) => Some(c),
        Some(TableOrList::List(mut l)) => {
            if l.is_empty() {
                None
            } else {
                Some(l.swap_remove(0))
            }
        }
    })
}

impl Blueprint {
    /// Parse a blueprint from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, BlueprintError> {
        let bp: Blueprint = toml::from_str(text)?;
        bp.check_name()?;
        Ok(bp)
    }

    /// Parse a blueprint from JSON text.
    pub fn from_json(text: &str) -> Result<Self, BlueprintError> {
        let bp: Blueprint = serde_json::from_str(text)?;
        bp.check_name()?;
        Ok(bp)
    }

    /// Serialize to the canonical TOML representation.
    pub fn to_toml_string(&self) -> Result<String, BlueprintError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn check_name(&self) -> Result<(), BlueprintError> {
        if self.name.is_empty() {
            return Err(BlueprintError::MissingName);
        }
        Ok(())
    }

    /// The blueprint's version parsed as semver.
    pub fn semver(&self) -> Result<Version, BlueprintError> {
        Version::parse(&self.version)
            .map_err(|e| BlueprintError::BadVersion(self.version.clone(), e))
    }

    /// Pick the version a commit of `self` over `head` should carry.
    ///
    /// The committed version is monotonically non-decreasing: when the
    /// submitted version is less than or equal to the head's, the head's
    /// patch field is bumped instead.
    pub fn bumped_version(&self, head: Option<&Blueprint>) -> Result<String, BlueprintError> {
        let new = self.semver()?;
        let Some(head) = head else {
            return Ok(new.to_string());
        };
        let old = head.semver()?;
        if new > old {
            Ok(new.to_string())
        } else {
            let mut bumped = old.clone();
            bumped.patch += 1;
            Ok(bumped.to_string())
        }
    }

    /// `(name, version-glob)` pairs for the modules list.
    pub fn module_nver(&self) -> Vec<(String, String)> {
        self.modules
            .iter()
            .map(|m| (m.name.clone(), m.version.clone()))
            .collect()
    }

    /// `(name, version-glob)` pairs for the packages list.
    pub fn package_nver(&self) -> Vec<(String, String)> {
        self.packages
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect()
    }

    /// The group names to pass to the resolver.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    /// The `[[repos.git]]` entries, empty when none are present.
    pub fn git_repos(&self) -> &[RepoGit] {
        self.repos.as_ref().map(|r| r.git.as_slice()).unwrap_or(&[])
    }

    /// Replace every module and package version with the exact version the
    /// resolver chose. Entries the resolver did not report keep their globs.
    pub fn freeze(&self, deps: &[crate::resolver::PackageNEVRA]) -> Blueprint {
        let mut frozen = self.clone();
        for req in frozen.modules.iter_mut().chain(frozen.packages.iter_mut()) {
            if let Some(dep) = deps.iter().find(|d| d.name == req.name) {
                req.version = dep.frozen_version();
            }
        }
        frozen
    }
}
