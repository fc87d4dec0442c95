//! Field-level blueprint diffs
//!
//! A diff is an ordered list of `{old, new}` records, one per differing
//! scalar field or list element. Added elements have `old = null`, removed
//! elements have `new = null`. Ordering is stable: Description, Version,
//! modules by name, packages by name, groups by name, then customizations.

use serde::{Deserialize, Serialize};

use super::{Blueprint, Customizations, GroupReq, PackageReq};

/// One side of a diff record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiffValue {
    Description(String),
    Version(String),
    Module(PackageReq),
    Package(PackageReq),
    Group(GroupReq),
    Customizations(Box<Customizations>),
}

/// A single difference between two blueprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub old: Option<DiffValue>,
    pub new: Option<DiffValue>,
}

impl DiffEntry {
    fn changed(old: DiffValue, new: DiffValue) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    fn added(new: DiffValue) -> Self {
        Self { old: None, new: Some(new) }
    }

    fn removed(old: DiffValue) -> Self {
        Self { old: Some(old), new: None }
    }
}

/// Compute the ordered field-level diff from `old` to `new`.
pub fn diff_blueprints(old: &Blueprint, new: &Blueprint) -> Vec<DiffEntry> {
    let mut entries = Vec::new();

    if old.description != new.description {
        entries.push(DiffEntry::changed(
            DiffValue::Description(old.description.clone()),
            DiffValue::Description(new.description.clone()),
        ));
    }
    if old.version != new.version {
        entries.push(DiffEntry::changed(
            DiffValue::Version(old.version.clone()),
            DiffValue::Version(new.version.clone()),
        ));
    }

    diff_reqs(&old.modules, &new.modules, DiffValue::Module, &mut entries);
    diff_reqs(&old.packages, &new.packages, DiffValue::Package, &mut entries);
    diff_groups(&old.groups, &new.groups, &mut entries);

    if old.customizations != new.customizations {
        let wrap = |c: &Option<Customizations>| {
            DiffValue::Customizations(Box::new(c.clone().unwrap_or_default()))
        };
        match (&old.customizations, &new.customizations) {
            (None, Some(_)) => entries.push(DiffEntry::added(wrap(&new.customizations))),
            (Some(_), None) => entries.push(DiffEntry::removed(wrap(&old.customizations))),
            _ => entries.push(DiffEntry::changed(
                wrap(&old.customizations),
                wrap(&new.customizations),
            )),
        }
    }

    entries
}

/// Diff two (name, version) request lists, matching elements by name and
/// walking the union of names in sorted order.
fn diff_reqs(
    old: &[PackageReq],
    new: &[PackageReq],
    wrap: fn(PackageReq) -> DiffValue,
    entries: &mut Vec<DiffEntry>,
) {
    for name in name_union(old.iter().map(|r| &r.name), new.iter().map(|r| &r.name)) {
        let o = old.iter().find(|r| r.name == name);
        let n = new.iter().find(|r| r.name == name);
        match (o, n) {
            (Some(o), Some(n)) if o != n => {
                entries.push(DiffEntry::changed(wrap(o.clone()), wrap(n.clone())));
            }
            (Some(o), None) => entries.push(DiffEntry::removed(wrap(o.clone()))),
            (None, Some(n)) => entries.push(DiffEntry::added(wrap(n.clone()))),
            _ => {}
        }
    }
}

fn diff_groups(old: &[GroupReq], new: &[GroupReq], entries: &mut Vec<DiffEntry>) {
    for name in name_union(old.iter().map(|g| &g.name), new.iter().map(|g| &g.name)) {
        let o = old.iter().any(|g| g.name == name);
        let n = new.iter().any(|g| g.name == name);
        let group = GroupReq { name };
        match (o, n) {
            (true, false) => entries.push(DiffEntry::removed(DiffValue::Group(group))),
            (false, true) => entries.push(DiffEntry::added(DiffValue::Group(group))),
            _ => {}
        }
    }
}

fn name_union<'a>(
    old: impl Iterator<Item = &'a String>,
    new: impl Iterator<Item = &'a String>,
) -> Vec<String> {
    let mut names: Vec<String> = old.chain(new).cloned().collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base() -> Blueprint {
        Blueprint::from_toml(
            r#"
name = "example-glusterfs"
description = "An example GlusterFS server with samba"
version = "0.0.1"

[[packages]]
name = "samba"
version = "4.*"
"#,
        )
        .unwrap()
    }

    #[test]
    fn identical_blueprints_have_empty_diff() {
        let bp = base();
        assert_eq!(diff_blueprints(&bp, &bp), vec![]);
    }

    #[test]
    fn workspace_edit_diff_ordering() {
        let old = base();
        let mut new = base();
        new.description = "An example GlusterFS server with samba, ws version".to_string();
        new.version = "0.3.0".to_string();
        new.packages.push(PackageReq {
            name: "tmux".to_string(),
            version: "*".to_string(),
        });

        let diff = diff_blueprints(&old, &new);
        assert_eq!(diff.len(), 3);
        assert_eq!(
            diff[0].new,
            Some(DiffValue::Description(new.description.clone()))
        );
        assert_eq!(diff[1].new, Some(DiffValue::Version("0.3.0".to_string())));
        assert_eq!(diff[2].old, None);
        assert_eq!(
            diff[2].new,
            Some(DiffValue::Package(PackageReq {
                name: "tmux".to_string(),
                version: "*".to_string(),
            }))
        );
    }

    #[test]
    fn diff_serializes_with_null_old() {
        let old = base();
        let mut new = base();
        new.packages.push(PackageReq {
            name: "tmux".to_string(),
            version: "*".to_string(),
        });
        let diff = diff_blueprints(&old, &new);
        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(
            json[0],
            serde_json::json!({"old": null, "new": {"Package": {"name": "tmux", "version": "*"}}})
        );
    }

    #[test]
    fn removed_module_has_null_new() {
        let mut old = base();
        old.modules.push(PackageReq {
            name: "glusterfs".to_string(),
            version: "3.*".to_string(),
        });
        let new = base();
        let diff = diff_blueprints(&old, &new);
        assert_eq!(diff.len(), 1);
        assert!(diff[0].new.is_none());
    }
}
