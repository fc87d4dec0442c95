//! Kickstart template scanning
//!
//! The composer needs two views of the shipped templates: the `%packages`
//! section of a type's kickstart (to size the type's own payload) and the
//! `installpkg` lines of the live-install template (extra packages the
//! live-iso path needs at build time).

use std::fs;
use std::path::Path;

use super::ComposeError;

/// The parsed `%packages` section of a kickstart template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplatePackages {
    pub packages: Vec<String>,
    pub groups: Vec<String>,
    pub excluded: Vec<String>,
    /// True when the `%packages` header carries `--nocore`.
    pub nocore: bool,
}

/// Parse the `%packages` section. The section may be left unterminated (the
/// composer closes it at build time); scanning stops at `%end` or EOF.
pub fn parse_packages_section(template: &str) -> TemplatePackages {
    let mut out = TemplatePackages::default();
    let mut in_packages = false;
    for line in template.lines() {
        let line = line.trim();
        if line.starts_with("%packages") {
            in_packages = true;
            out.nocore = line.split_whitespace().any(|t| t == "--nocore");
            continue;
        }
        if !in_packages {
            continue;
        }
        if line == "%end" {
            break;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(group) = line.strip_prefix('@') {
            out.groups.push(group.trim().to_string());
        } else if let Some(excluded) = line.strip_prefix('-') {
            out.excluded.push(excluded.trim().to_string());
        } else {
            out.packages.push(line.to_string());
        }
    }
    out
}

/// Extra package names required to assemble a live iso, extracted from the
/// `installpkg` lines of `<share_dir>/live/live-install.tmpl`. Other types
/// contribute no extras.
pub fn live_template_packages(share_dir: &Path) -> Result<Vec<String>, ComposeError> {
    let path = share_dir.join("live").join("live-install.tmpl");
    let text = fs::read_to_string(&path).map_err(|e| {
        ComposeError::BuildFailed(format!(
            "cannot read live template {}: {e}",
            path.display()
        ))
    })?;

    let mut packages = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with("installpkg") {
            continue;
        }
        let tokens = shell_words::split(line)
            .map_err(|e| ComposeError::BuildFailed(format!("bad live template line: {e}")))?;
        packages.extend(
            tokens
                .into_iter()
                .skip(1)
                .filter(|t| !t.starts_with("--")),
        );
    }
    Ok(packages)
}
