//! Git repository to rpm materialization
//!
//! Each `[[repos.git]]` blueprint entry names a repository, a ref, and a
//! destination directory inside the image. At build time the ref is cloned
//! into a transient workspace, packed into a source archive, built into a
//! binary rpm that installs the tree at the destination, and collected into
//! a local repository under the build's result directory. The final
//! kickstart then points a `gitrpms` repo at it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use git2::build::CheckoutBuilder;
use git2::Repository;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::blueprint::{Blueprint, RepoGit};

use super::ComposeError;

/// Directory under the results dir that holds the built rpms.
const GITRPM_DIR: &str = "gitrpms";

/// Build rpms for every `[[repos.git]]` entry and collect them into a local
/// repository under `results_dir`. Returns the repository path, or `None`
/// when the blueprint has no git entries. Any failure aborts the build.
pub fn create_gitrpm_repo(
    results_dir: &Path,
    blueprint: &Blueprint,
) -> Result<Option<PathBuf>, ComposeError> {
    let entries = blueprint.git_repos();
    if entries.is_empty() {
        return Ok(None);
    }

    let repo_dir = results_dir.join(GITRPM_DIR);
    fs::create_dir_all(&repo_dir)
        .map_err(|e| ComposeError::BuildFailed(format!("creating gitrpm repo dir: {e}")))?;

    for entry in entries {
        build_git_rpm(&repo_dir, entry)?;
    }

    // Index the collected rpms so the installer can use the directory as a
    // repository.
    run_checked(
        Command::new("createrepo_c").arg(&repo_dir),
        "createrepo_c",
    )?;

    info!(repo = %repo_dir.display(), rpms = entries.len(), "created gitrpm repository");
    Ok(Some(repo_dir))
}

/// The rpm file names (without the `.rpm` suffix) collected in the gitrpm
/// repository; these are appended to the kickstart package list.
pub fn gitrpm_package_names(repo_dir: &Path) -> Result<Vec<String>, ComposeError> {
    let mut names = Vec::new();
    let entries = fs::read_dir(repo_dir)
        .map_err(|e| ComposeError::BuildFailed(format!("reading gitrpm repo: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| ComposeError::BuildFailed(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(base) = name.strip_suffix(".rpm") {
            names.push(base.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn build_git_rpm(repo_dir: &Path, entry: &RepoGit) -> Result<(), ComposeError> {
    let workspace = TempDir::new()
        .map_err(|e| ComposeError::BuildFailed(format!("creating gitrpm workspace: {e}")))?;
    let checkout = workspace.path().join("checkout");

    debug!(repo = %entry.repo, git_ref = %entry.git_ref, "cloning git rpm source");
    let repo = Repository::clone(&entry.repo, &checkout).map_err(|e| {
        ComposeError::BuildFailed(format!("cloning {} failed: {}", entry.repo, e.message()))
    })?;
    let object = repo.revparse_single(&entry.git_ref).map_err(|e| {
        ComposeError::BuildFailed(format!(
            "ref {} not found in {}: {}",
            entry.git_ref,
            entry.repo,
            e.message()
        ))
    })?;
    repo.checkout_tree(&object, Some(CheckoutBuilder::new().force()))
        .and_then(|_| repo.set_head_detached(object.id()))
        .map_err(|e| {
            ComposeError::BuildFailed(format!("checking out {}: {}", entry.git_ref, e.message()))
        })?;

    // Pack the checkout (minus .git) into the source archive rpmbuild
    // expects to find in SOURCES/.
    let topdir = workspace.path().join("rpmbuild");
    let sources = topdir.join("SOURCES");
    fs::create_dir_all(&sources)
        .map_err(|e| ComposeError::BuildFailed(format!("creating rpmbuild topdir: {e}")))?;
    let archive_name = format!("{}-{}.tar", entry.rpmname, entry.rpmversion);
    let prefix = format!("{}-{}", entry.rpmname, entry.rpmversion);
    write_source_archive(&checkout, &sources.join(&archive_name), &prefix)?;

    let spec_path = topdir.join(format!("{}.spec", entry.rpmname));
    fs::write(&spec_path, render_spec(entry, &archive_name))
        .map_err(|e| ComposeError::BuildFailed(format!("writing spec file: {e}")))?;

    run_checked(
        Command::new("rpmbuild")
            .arg("-bb")
            .arg("--define")
            .arg(format!("_topdir {}", topdir.display()))
            .arg(&spec_path),
        "rpmbuild",
    )?;

    // Collect everything rpmbuild produced into the shared repo dir.
    for rpm in walkdir::WalkDir::new(topdir.join("RPMS"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "rpm").unwrap_or(false))
    {
        let dest = repo_dir.join(rpm.file_name());
        fs::copy(rpm.path(), &dest)
            .map_err(|e| ComposeError::BuildFailed(format!("collecting rpm: {e}")))?;
    }
    Ok(())
}

/// Tar up `checkout` under `prefix/`, leaving the `.git` directory behind.
fn write_source_archive(
    checkout: &Path,
    archive: &Path,
    prefix: &str,
) -> Result<(), ComposeError> {
    let file = fs::File::create(archive)
        .map_err(|e| ComposeError::BuildFailed(format!("creating source archive: {e}")))?;
    let mut builder = tar::Builder::new(file);
    for entry in walkdir::WalkDir::new(checkout)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let rel = entry.path().strip_prefix(checkout).map_err(|e| {
            ComposeError::BuildFailed(format!("archiving source: {e}"))
        })?;
        builder
            .append_path_with_name(entry.path(), Path::new(prefix).join(rel))
            .map_err(|e| ComposeError::BuildFailed(format!("archiving source: {e}")))?;
    }
    builder
        .finish()
        .map_err(|e| ComposeError::BuildFailed(format!("finishing source archive: {e}")))?;
    Ok(())
}

/// A minimal spec that installs the packaged tree at the entry's
/// destination.
fn render_spec(entry: &RepoGit, archive_name: &str) -> String {
    format!(
        r#"Name: {name}
Version: {version}
Release: {release}
Summary: {summary}
License: Unspecified
Source0: {archive}
BuildArch: noarch

%description
{summary}

%prep
%setup -q

%install
mkdir -p %{{buildroot}}{destination}
cp -a . %{{buildroot}}{destination}/

%files
{destination}/
"#,
        name = entry.rpmname,
        version = entry.rpmversion,
        release = entry.rpmrelease,
        summary = entry.summary,
        archive = archive_name,
        destination = entry.destination,
    )
}

fn run_checked(command: &mut Command, what: &str) -> Result<(), ComposeError> {
    let output = command
        .output()
        .map_err(|e| ComposeError::BuildFailed(format!("running {what}: {e}")))?;
    if !output.status.success() {
        return Err(ComposeError::BuildFailed(format!(
            "{what} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}
