//! Commit-versioned blueprint store
//!
//! Blueprints live as `<name>.toml` blobs at the root of a bare git
//! repository, one branch per line of history (`master` by default), with a
//! mutable per-branch workspace overlay beside the repository. The store is
//! a narrow capability over the repository: read, write, delete, log, diff,
//! tag, and checkout by commit id.
//!
//! Every store operation runs under the process-wide store lock (the
//! `Mutex<BlueprintStore>` in the application state); nothing here takes
//! additional locks.

pub mod workspace;

use std::path::Path;

use chrono::{TimeZone, Utc};
use git2::{BranchType, Repository, Signature, Sort};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::blueprint::{diff_blueprints, Blueprint, BlueprintError, DiffEntry};

pub use workspace::Workspace;

/// The default line of blueprint history.
pub const DEFAULT_BRANCH: &str = "master";

/// Sentinel commit names accepted by [`BlueprintStore::diff`].
pub const COMMIT_NEWEST: &str = "NEWEST";
pub const COMMIT_WORKSPACE: &str = "WORKSPACE";

/// Blueprint store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown blueprint: {0}")]
    UnknownBlueprint(String),

    #[error("Unknown commit: {0}")]
    UnknownCommit(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Blueprint(#[from] BlueprintError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry in a blueprint's change log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub commit: String,
    pub timestamp: String,
    pub message: String,
    /// Integer revision attached only to tagged commits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

/// Result of reading the effective blueprint for a name.
#[derive(Debug, Clone)]
pub struct BlueprintInfo {
    pub blueprint: Blueprint,
    /// True iff a workspace overlay exists and differs from the head.
    pub changed: bool,
}

pub struct BlueprintStore {
    repo: Repository,
    workspace: Workspace,
}

impl BlueprintStore {
    /// Open the store, creating the bare repository (with an empty initial
    /// commit on `master`) and the workspace tree on first use.
    pub fn open(repo_dir: &Path) -> Result<Self, StoreError> {
        let git_dir = repo_dir.join("git");
        let repo_path = git_dir.join("repo.git");
        let workspace = Workspace::new(git_dir.join("workspace"));
        std::fs::create_dir_all(workspace.root())?;

        let repo = if repo_path.exists() {
            Repository::open_bare(&repo_path)?
        } else {
            let repo = Repository::init_bare(&repo_path)?;
            {
                let tree_oid = repo.treebuilder(None)?.write()?;
                let tree = repo.find_tree(tree_oid)?;
                let sig = signature()?;
                repo.commit(
                    Some(&branch_ref(DEFAULT_BRANCH)),
                    &sig,
                    &sig,
                    "Initial blueprint repository commit",
                    &tree,
                    &[],
                )?;
            }
            info!(path = %repo_path.display(), "initialized blueprint repository");
            repo
        };

        Ok(Self { repo, workspace })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn branch_commit(&self, branch: &str) -> Result<git2::Commit<'_>, StoreError> {
        let branch = self.repo.find_branch(branch, BranchType::Local)?;
        Ok(branch.get().peel_to_commit()?)
    }

    /// The commit to use as parent when writing to `branch`, creating the
    /// branch from master's head if it does not exist yet.
    fn branch_commit_or_create(&self, branch: &str) -> Result<git2::Commit<'_>, StoreError> {
        match self.repo.find_branch(branch, BranchType::Local) {
            Ok(b) => Ok(b.get().peel_to_commit()?),
            Err(_) => {
                let master = self.branch_commit(DEFAULT_BRANCH)?;
                self.repo.branch(branch, &master, false)?;
                debug!(branch, "created blueprint branch");
                Ok(master)
            }
        }
    }

    fn blob_at<'a>(
        &'a self,
        commit: &git2::Commit<'a>,
        name: &str,
    ) -> Result<Option<git2::Blob<'a>>, StoreError> {
        let tree = commit.tree()?;
        let result = match tree.get_name(&blueprint_file(name)) {
            Some(entry) => Ok(Some(self.repo.find_blob(entry.id())?)),
            None => Ok(None),
        };
        result
    }

    fn parse_blob(blob: &git2::Blob<'_>) -> Result<Blueprint, StoreError> {
        let text = std::str::from_utf8(blob.content()).map_err(|e| {
            StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Ok(Blueprint::from_toml(text)?)
    }

    /// Read the committed head of `(branch, name)`.
    pub fn read(&self, branch: &str, name: &str) -> Result<Blueprint, StoreError> {
        let commit = self
            .branch_commit(branch)
            .map_err(|_| StoreError::UnknownBlueprint(name.to_string()))?;
        match self.blob_at(&commit, name)? {
            Some(blob) => Self::parse_blob(&blob),
            None => Err(StoreError::UnknownBlueprint(name.to_string())),
        }
    }

    /// Read the committed head plus the identity of the last commit that
    /// changed it. Builds are reproducible from this pair.
    pub fn read_with_commit_id(
        &self,
        branch: &str,
        name: &str,
    ) -> Result<(String, Blueprint), StoreError> {
        let blueprint = self.read(branch, name)?;
        let commits = self.file_commits(branch, name)?;
        let head = commits
            .first()
            .ok_or_else(|| StoreError::UnknownBlueprint(name.to_string()))?;
        Ok((head.to_string(), blueprint))
    }

    /// Read the blueprint content as of a specific commit.
    pub fn read_at_commit(
        &self,
        branch: &str,
        name: &str,
        commit_id: &str,
    ) -> Result<Blueprint, StoreError> {
        let oid = git2::Oid::from_str(commit_id)
            .map_err(|_| StoreError::UnknownCommit(commit_id.to_string()))?;
        let commit = self
            .repo
            .find_commit(oid)
            .map_err(|_| StoreError::UnknownCommit(commit_id.to_string()))?;
        let _ = branch; // content addressing is branch-independent
        match self.blob_at(&commit, name)? {
            Some(blob) => Self::parse_blob(&blob),
            None => Err(StoreError::UnknownBlueprint(name.to_string())),
        }
    }

    /// The effective blueprint for `(branch, name)`: the workspace overlay
    /// when present, the committed head otherwise.
    pub fn info(&self, branch: &str, name: &str) -> Result<BlueprintInfo, StoreError> {
        let head = self.read(branch, name);
        match self.workspace.read(branch, name)? {
            Some(ws) => {
                let changed = match &head {
                    Ok(head) => head != &ws,
                    Err(_) => true,
                };
                Ok(BlueprintInfo {
                    blueprint: ws,
                    changed,
                })
            }
            None => Ok(BlueprintInfo {
                blueprint: head?,
                changed: false,
            }),
        }
    }

    /// Blueprint names on `branch` in lexicographic order, with the
    /// authoritative total. `limit = 0` still reports the full total.
    pub fn list(
        &self,
        branch: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(usize, Vec<String>), StoreError> {
        let commit = match self.branch_commit(branch) {
            Ok(c) => c,
            Err(_) => return Ok((0, Vec::new())),
        };
        let tree = commit.tree()?;
        let mut names: Vec<String> = tree
            .iter()
            .filter_map(|entry| {
                entry
                    .name()
                    .and_then(|n| n.strip_suffix(".toml"))
                    .map(|n| n.to_string())
            })
            .collect();
        names.sort();
        let total = names.len();
        Ok((total, names.into_iter().skip(offset).take(limit).collect()))
    }

    /// Commit `blueprint` to `branch`, bumping the version when it does not
    /// advance past the head's, and clear the workspace entry for the name.
    /// Returns the committed blueprint.
    pub fn new_blueprint(
        &self,
        branch: &str,
        blueprint: &Blueprint,
    ) -> Result<Blueprint, StoreError> {
        let parent = self.branch_commit_or_create(branch)?;
        let head = match self.blob_at(&parent, &blueprint.name)? {
            Some(blob) => Some(Self::parse_blob(&blob)?),
            None => None,
        };

        let mut committed = blueprint.clone();
        committed.version = blueprint.bumped_version(head.as_ref())?;

        let message = format!(
            "Recipe {}, version {} saved.",
            committed.name, committed.version
        );
        self.commit_file(
            branch,
            &parent,
            &blueprint_file(&committed.name),
            Some(committed.to_toml_string()?.as_bytes()),
            &message,
        )?;
        self.workspace.delete(branch, &committed.name)?;
        info!(branch, name = %committed.name, version = %committed.version,
              "committed blueprint");
        Ok(committed)
    }

    /// Remove both the workspace overlay and the committed entry.
    pub fn delete(&self, branch: &str, name: &str) -> Result<(), StoreError> {
        let parent = self.branch_commit(branch)
            .map_err(|_| StoreError::UnknownBlueprint(name.to_string()))?;
        if self.blob_at(&parent, name)?.is_none() {
            return Err(StoreError::UnknownBlueprint(name.to_string()));
        }
        let message = format!("Recipe {name} deleted");
        self.commit_file(branch, &parent, &blueprint_file(name), None, &message)?;
        self.workspace.delete(branch, name)?;
        info!(branch, name, "deleted blueprint");
        Ok(())
    }

    /// Write a tree derived from `parent` with `file` replaced (or removed
    /// when `content` is `None`) and commit it to `branch`. The tree is
    /// prepared first; the commit either lands atomically or the reference
    /// stays untouched.
    fn commit_file(
        &self,
        branch: &str,
        parent: &git2::Commit<'_>,
        file: &str,
        content: Option<&[u8]>,
        message: &str,
    ) -> Result<git2::Oid, StoreError> {
        let parent_tree = parent.tree()?;
        let mut builder = self.repo.treebuilder(Some(&parent_tree))?;
        match content {
            Some(bytes) => {
                let blob = self.repo.blob(bytes)?;
                builder.insert(file, blob, 0o100644)?;
            }
            None => builder.remove(file)?,
        }
        let tree_oid = builder.write()?;
        let tree = self.repo.find_tree(tree_oid)?;
        let sig = signature()?;
        let oid = self.repo.commit(
            Some(&branch_ref(branch)),
            &sig,
            &sig,
            message,
            &tree,
            &[parent],
        )?;
        Ok(oid)
    }

    /// Oids of the commits that changed `name`, newest first.
    fn file_commits(&self, branch: &str, name: &str) -> Result<Vec<git2::Oid>, StoreError> {
        let head = self
            .branch_commit(branch)
            .map_err(|_| StoreError::UnknownBlueprint(name.to_string()))?;
        let file = blueprint_file(name);

        let mut walk = self.repo.revwalk()?;
        walk.push(head.id())?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        let mut commits = Vec::new();
        for oid in walk {
            let oid = oid?;
            let commit = self.repo.find_commit(oid)?;
            let entry_id = commit.tree()?.get_name(&file).map(|e| e.id());
            let Some(entry_id) = entry_id else { continue };
            let parent_entry_id = match commit.parent(0) {
                Ok(parent) => parent.tree()?.get_name(&file).map(|e| e.id()),
                Err(_) => None,
            };
            if parent_entry_id != Some(entry_id) {
                commits.push(oid);
            }
        }
        Ok(commits)
    }

    /// Commit log for `(branch, name)` with the authoritative total.
    pub fn changes(
        &self,
        branch: &str,
        name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(usize, Vec<ChangeEntry>), StoreError> {
        let commits = self.file_commits(branch, name)?;
        if commits.is_empty() {
            return Err(StoreError::UnknownBlueprint(name.to_string()));
        }
        let total = commits.len();
        let revisions = self.tagged_revisions(branch, name)?;

        let mut entries = Vec::new();
        for oid in commits.into_iter().skip(offset).take(limit) {
            let commit = self.repo.find_commit(oid)?;
            let ts = Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .unwrap_or_else(Utc::now);
            entries.push(ChangeEntry {
                commit: oid.to_string(),
                timestamp: ts.to_rfc3339(),
                message: commit.message().unwrap_or("").trim_end().to_string(),
                revision: revisions
                    .iter()
                    .find(|(tagged, _)| *tagged == oid)
                    .map(|(_, rev)| *rev),
            });
        }
        Ok((total, entries))
    }

    /// `(commit, revision)` pairs from the `<branch>/<name>/r<N>` tags.
    fn tagged_revisions(
        &self,
        branch: &str,
        name: &str,
    ) -> Result<Vec<(git2::Oid, u64)>, StoreError> {
        let pattern = format!("{branch}/{name}/r*");
        let mut revisions = Vec::new();
        for tag in self.repo.tag_names(Some(&pattern))?.iter().flatten() {
            let Some(rev) = tag
                .rsplit('/')
                .next()
                .and_then(|r| r.strip_prefix('r'))
                .and_then(|r| r.parse::<u64>().ok())
            else {
                continue;
            };
            let obj = self.repo.revparse_single(&format!("refs/tags/{tag}"))?;
            let commit = obj.peel_to_commit()?;
            revisions.push((commit.id(), rev));
        }
        Ok(revisions)
    }

    /// Attach the next integer revision to the head commit for `name`.
    /// Tagging an already-tagged head is a no-op; the revision returned is
    /// the existing one.
    pub fn tag(&self, branch: &str, name: &str) -> Result<u64, StoreError> {
        let commits = self.file_commits(branch, name)?;
        let head = *commits
            .first()
            .ok_or_else(|| StoreError::UnknownBlueprint(name.to_string()))?;

        let revisions = self.tagged_revisions(branch, name)?;
        if let Some((_, rev)) = revisions.iter().find(|(oid, _)| *oid == head) {
            debug!(branch, name, revision = rev, "head commit already tagged");
            return Ok(*rev);
        }
        let next = revisions.iter().map(|(_, rev)| *rev).max().unwrap_or(0) + 1;
        let obj = self.repo.find_object(head, None)?;
        self.repo
            .tag_lightweight(&format!("{branch}/{name}/r{next}"), &obj, false)?;
        info!(branch, name, revision = next, "tagged blueprint");
        Ok(next)
    }

    /// Restore the blueprint content at `commit` as a new commit on the
    /// head. The commit message is part of the API contract.
    pub fn undo(&self, branch: &str, name: &str, commit_id: &str) -> Result<(), StoreError> {
        let old = self.read_at_commit(branch, name, commit_id)?;
        let parent = self.branch_commit(branch)?;
        let message = format!("{name}.toml reverted to commit {commit_id}");
        self.commit_file(
            branch,
            &parent,
            &blueprint_file(name),
            Some(old.to_toml_string()?.as_bytes()),
            &message,
        )?;
        info!(branch, name, commit = commit_id, "reverted blueprint");
        Ok(())
    }

    /// Resolve a commit argument (`NEWEST`, `WORKSPACE`, or a commit id)
    /// into blueprint content.
    pub fn resolve_rev(
        &self,
        branch: &str,
        name: &str,
        rev: &str,
    ) -> Result<Blueprint, StoreError> {
        match rev {
            COMMIT_NEWEST => self.read(branch, name),
            COMMIT_WORKSPACE => match self.workspace.read(branch, name)? {
                Some(ws) => Ok(ws),
                // No overlay: the workspace view is the committed head.
                None => self.read(branch, name),
            },
            commit_id => self.read_at_commit(branch, name, commit_id),
        }
    }

    /// Ordered field-level diff between two revisions of `name`.
    pub fn diff(
        &self,
        branch: &str,
        name: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<DiffEntry>, StoreError> {
        let old = self.resolve_rev(branch, name, from)?;
        let new = self.resolve_rev(branch, name, to)?;
        Ok(diff_blueprints(&old, &new))
    }
}

fn blueprint_file(name: &str) -> String {
    format!("{name}.toml")
}

fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

fn signature() -> Result<Signature<'static>, git2::Error> {
    Signature::now("imageforge-server", "imageforge@localhost")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn example(name: &str, version: &str) -> Blueprint {
        Blueprint::from_toml(&format!(
            r#"
name = "{name}"
description = "An example GlusterFS server with samba"
version = "{version}"

[[packages]]
name = "samba"
version = "4.*"
"#
        ))
        .unwrap()
    }

    fn store(dir: &TempDir) -> BlueprintStore {
        BlueprintStore::open(dir.path()).unwrap()
    }

    #[test]
    fn commit_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bp = example("example-glusterfs", "0.0.1");
        let committed = store.new_blueprint(DEFAULT_BRANCH, &bp).unwrap();
        assert_eq!(committed.version, "0.0.1");

        let read = store.read(DEFAULT_BRANCH, "example-glusterfs").unwrap();
        assert_eq!(read, committed);
    }

    #[test]
    fn repeated_commit_bumps_patch_version() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bp = example("example-glusterfs", "0.0.1");
        store.new_blueprint(DEFAULT_BRANCH, &bp).unwrap();
        let second = store.new_blueprint(DEFAULT_BRANCH, &bp).unwrap();
        assert_eq!(second.version, "0.0.2");
    }

    #[test]
    fn unknown_blueprint_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.read(DEFAULT_BRANCH, "missing"),
            Err(StoreError::UnknownBlueprint(_))
        ));
    }

    #[test]
    fn list_reports_total_even_with_zero_limit() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .new_blueprint(DEFAULT_BRANCH, &example("aaa", "0.0.1"))
            .unwrap();
        store
            .new_blueprint(DEFAULT_BRANCH, &example("bbb", "0.0.1"))
            .unwrap();
        let (total, names) = store.list(DEFAULT_BRANCH, 0, 0).unwrap();
        assert_eq!(total, 2);
        assert!(names.is_empty());

        let (total, names) = store.list(DEFAULT_BRANCH, 20, 0).unwrap();
        assert_eq!(total, 2);
        assert_eq!(names, vec!["aaa", "bbb"]);
    }

    #[test]
    fn workspace_shadows_head_until_deleted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bp = example("example-glusterfs", "0.0.1");
        store.new_blueprint(DEFAULT_BRANCH, &bp).unwrap();

        let mut ws = bp.clone();
        ws.description = "workspace edit".to_string();
        store.workspace().write(DEFAULT_BRANCH, &ws).unwrap();

        let info = store.info(DEFAULT_BRANCH, "example-glusterfs").unwrap();
        assert!(info.changed);
        assert_eq!(info.blueprint.description, "workspace edit");

        store
            .workspace()
            .delete(DEFAULT_BRANCH, "example-glusterfs")
            .unwrap();
        let info = store.info(DEFAULT_BRANCH, "example-glusterfs").unwrap();
        assert!(!info.changed);
        assert_eq!(
            info.blueprint.description,
            "An example GlusterFS server with samba"
        );
    }

    #[test]
    fn workspace_equal_to_head_is_not_changed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bp = example("example-glusterfs", "0.0.1");
        let committed = store.new_blueprint(DEFAULT_BRANCH, &bp).unwrap();
        store.workspace().write(DEFAULT_BRANCH, &committed).unwrap();
        let info = store.info(DEFAULT_BRANCH, "example-glusterfs").unwrap();
        assert!(!info.changed);
    }

    #[test]
    fn commit_clears_workspace_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bp = example("example-glusterfs", "0.0.1");
        let mut ws = bp.clone();
        ws.description = "stale edit".to_string();
        store.workspace().write(DEFAULT_BRANCH, &ws).unwrap();
        store.new_blueprint(DEFAULT_BRANCH, &bp).unwrap();
        assert!(store
            .workspace()
            .read(DEFAULT_BRANCH, "example-glusterfs")
            .unwrap()
            .is_none());
    }

    #[test]
    fn delete_removes_head_and_overlay() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bp = example("example-glusterfs", "0.0.1");
        store.new_blueprint(DEFAULT_BRANCH, &bp).unwrap();
        store.workspace().write(DEFAULT_BRANCH, &bp).unwrap();

        store.delete(DEFAULT_BRANCH, "example-glusterfs").unwrap();
        assert!(matches!(
            store.info(DEFAULT_BRANCH, "example-glusterfs"),
            Err(StoreError::UnknownBlueprint(_))
        ));
        assert!(matches!(
            store.delete(DEFAULT_BRANCH, "example-glusterfs"),
            Err(StoreError::UnknownBlueprint(_))
        ));
    }

    #[test]
    fn changes_log_is_newest_first_with_total() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .new_blueprint(DEFAULT_BRANCH, &example("example-glusterfs", "0.0.1"))
            .unwrap();
        store
            .new_blueprint(DEFAULT_BRANCH, &example("example-glusterfs", "0.1.0"))
            .unwrap();
        // An unrelated blueprint's commits never show up in the log.
        store
            .new_blueprint(DEFAULT_BRANCH, &example("other", "0.0.1"))
            .unwrap();

        let (total, entries) = store
            .changes(DEFAULT_BRANCH, "example-glusterfs", 20, 0)
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(
            entries[0].message,
            "Recipe example-glusterfs, version 0.1.0 saved."
        );
        assert_eq!(
            entries[1].message,
            "Recipe example-glusterfs, version 0.0.1 saved."
        );

        let (total, entries) = store
            .changes(DEFAULT_BRANCH, "example-glusterfs", 1, 1)
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].message,
            "Recipe example-glusterfs, version 0.0.1 saved."
        );
    }

    #[test]
    fn tag_advances_only_after_a_new_commit() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .new_blueprint(DEFAULT_BRANCH, &example("example-glusterfs", "0.0.1"))
            .unwrap();
        assert_eq!(store.tag(DEFAULT_BRANCH, "example-glusterfs").unwrap(), 1);
        // No intervening commit: revision does not advance.
        assert_eq!(store.tag(DEFAULT_BRANCH, "example-glusterfs").unwrap(), 1);

        store
            .new_blueprint(DEFAULT_BRANCH, &example("example-glusterfs", "0.1.0"))
            .unwrap();
        assert_eq!(store.tag(DEFAULT_BRANCH, "example-glusterfs").unwrap(), 2);

        let (_, entries) = store
            .changes(DEFAULT_BRANCH, "example-glusterfs", 20, 0)
            .unwrap();
        assert_eq!(entries[0].revision, Some(2));
        assert_eq!(entries[1].revision, Some(1));
    }

    #[test]
    fn undo_restores_old_content_with_contract_message() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .new_blueprint(DEFAULT_BRANCH, &example("example-glusterfs", "0.0.1"))
            .unwrap();
        let (first_commit, _) = store
            .read_with_commit_id(DEFAULT_BRANCH, "example-glusterfs")
            .unwrap();
        store
            .new_blueprint(DEFAULT_BRANCH, &example("example-glusterfs", "0.2.0"))
            .unwrap();

        store
            .undo(DEFAULT_BRANCH, "example-glusterfs", &first_commit)
            .unwrap();
        let head = store.read(DEFAULT_BRANCH, "example-glusterfs").unwrap();
        assert_eq!(head.version, "0.0.1");

        let (_, entries) = store
            .changes(DEFAULT_BRANCH, "example-glusterfs", 1, 0)
            .unwrap();
        assert_eq!(
            entries[0].message,
            format!("example-glusterfs.toml reverted to commit {first_commit}")
        );
    }

    #[test]
    fn undo_with_bad_commit_is_unknown_commit() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .new_blueprint(DEFAULT_BRANCH, &example("example-glusterfs", "0.0.1"))
            .unwrap();
        assert!(matches!(
            store.undo(DEFAULT_BRANCH, "example-glusterfs", "not-a-commit"),
            Err(StoreError::UnknownCommit(_))
        ));
    }

    #[test]
    fn diff_of_identical_revisions_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .new_blueprint(DEFAULT_BRANCH, &example("example-glusterfs", "0.0.1"))
            .unwrap();
        let diff = store
            .diff(DEFAULT_BRANCH, "example-glusterfs", COMMIT_NEWEST, COMMIT_NEWEST)
            .unwrap();
        assert!(diff.is_empty());

        // Overlay equal to the head also diffs empty.
        let head = store.read(DEFAULT_BRANCH, "example-glusterfs").unwrap();
        store.workspace().write(DEFAULT_BRANCH, &head).unwrap();
        let diff = store
            .diff(
                DEFAULT_BRANCH,
                "example-glusterfs",
                COMMIT_NEWEST,
                COMMIT_WORKSPACE,
            )
            .unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn branches_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .new_blueprint(DEFAULT_BRANCH, &example("shared", "0.0.1"))
            .unwrap();
        store
            .new_blueprint("rawhide", &example("rawhide-only", "0.0.1"))
            .unwrap();

        let (_, master_names) = store.list(DEFAULT_BRANCH, 20, 0).unwrap();
        assert_eq!(master_names, vec!["shared"]);
        let (_, branch_names) = store.list("rawhide", 20, 0).unwrap();
        assert_eq!(branch_names, vec!["rawhide-only", "shared"]);
    }
}
