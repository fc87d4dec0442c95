//! Build queue
//!
//! The queue is directory-based: `queue/new/` and `queue/run/` hold symlinks
//! into `results/<build_id>/`, and a build's `STATUS` file is the single
//! source of truth for its state. The finished set is virtual, reconstructed
//! by scanning `results/*/STATUS`.
//!
//! Status progresses monotonically along
//! `WAITING -> RUNNING -> FINISHED | FAILED`, plus the terminal `CANCELED`;
//! no transition ever reverts.

pub mod worker;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blueprint::Blueprint;
use crate::compose::BuilderConfig;
use crate::resolver::PackageNEVRA;

pub use worker::Worker;

/// Timestamp file names inside a result directory, holding epoch seconds.
pub const TS_CREATED: &str = "TS_CREATED";
pub const TS_STARTED: &str = "TS_STARTED";
pub const TS_FINISHED: &str = "TS_FINISHED";

/// Marker file left by `cancel` for a running build; the worker observes it
/// and classifies the exit as canceled instead of failed.
pub const CANCEL_MARKER: &str = "CANCEL";

/// The builder child's process id, written by the worker for the lifetime
/// of the sub-process.
pub const PID_FILE: &str = "PID";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{0} is not a valid build uuid")]
    UnknownUuid(String),

    #[error("Build {uuid} is not in {expected} state (is {actual})")]
    WrongState {
        uuid: String,
        expected: &'static str,
        actual: BuildStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// The build status token persisted in a result directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl BuildStatus {
    /// Terminal states can no longer be canceled, only deleted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Finished | BuildStatus::Failed | BuildStatus::Canceled
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            BuildStatus::Waiting => "WAITING",
            BuildStatus::Running => "RUNNING",
            BuildStatus::Finished => "FINISHED",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Canceled => "CANCELED",
        };
        f.write_str(token)
    }
}

impl FromStr for BuildStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "WAITING" => Ok(BuildStatus::Waiting),
            "RUNNING" => Ok(BuildStatus::Running),
            "FINISHED" => Ok(BuildStatus::Finished),
            "FAILED" => Ok(BuildStatus::Failed),
            "CANCELED" => Ok(BuildStatus::Canceled),
            _ => Err(()),
        }
    }
}

/// Write the status token. The write goes to a temp file first so readers
/// never observe a partial token.
pub fn write_status(results_dir: &Path, status: BuildStatus) -> std::io::Result<()> {
    let tmp = results_dir.join(".STATUS.tmp");
    fs::write(&tmp, status.to_string())?;
    fs::rename(tmp, results_dir.join("STATUS"))
}

pub fn read_status(results_dir: &Path) -> Option<BuildStatus> {
    let text = fs::read_to_string(results_dir.join("STATUS")).ok()?;
    text.parse().ok()
}

/// Write `<name>` as the current time in epoch seconds.
pub fn write_timestamp(results_dir: &Path, name: &str) -> std::io::Result<()> {
    fs::write(
        results_dir.join(name),
        chrono::Utc::now().timestamp().to_string(),
    )
}

pub fn read_timestamp(results_dir: &Path, name: &str) -> Option<i64> {
    fs::read_to_string(results_dir.join(name))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Summary of a build for list/status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeStatus {
    pub id: String,
    pub blueprint: String,
    pub version: String,
    pub compose_type: String,
    pub image_size: u64,
    pub queue_status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_created: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_started: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_finished: Option<i64>,
}

/// Detailed build info for the info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ComposeInfo {
    pub id: String,
    pub config: BuilderConfig,
    pub blueprint: Blueprint,
    pub commit: String,
    pub deps: DepsList,
    pub compose_type: String,
    pub queue_status: BuildStatus,
    pub image_size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepsList {
    pub packages: Vec<PackageNEVRA>,
}

/// Queue handle: path layout plus the enqueue/cancel/delete operations and
/// the status readers. The worker loop lives in [`worker`].
#[derive(Debug, Clone)]
pub struct Queue {
    lib_dir: PathBuf,
}

impl Queue {
    /// Open the queue, creating the directory layout on first use.
    pub fn open(lib_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(lib_dir.join("queue/new"))?;
        fs::create_dir_all(lib_dir.join("queue/run"))?;
        fs::create_dir_all(lib_dir.join("results"))?;
        Ok(Self {
            lib_dir: lib_dir.to_path_buf(),
        })
    }

    pub fn new_dir(&self) -> PathBuf {
        self.lib_dir.join("queue/new")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.lib_dir.join("queue/run")
    }

    pub fn results_dir(&self, uuid: &str) -> PathBuf {
        self.lib_dir.join("results").join(uuid)
    }

    /// Crash recovery, run once at process start: anything still in `run/`
    /// was interrupted by an unclean shutdown and is reclassified FAILED.
    pub fn recover(&self) -> std::io::Result<()> {
        for entry in fs::read_dir(self.run_dir())? {
            let entry = entry?;
            let uuid = entry.file_name().to_string_lossy().to_string();
            let results = self.results_dir(&uuid);
            error!(build = %uuid, "build was interrupted by an unclean shutdown, marking failed");
            if results.exists() {
                write_status(&results, BuildStatus::Failed)?;
                append_queue_log(
                    &results,
                    "build interrupted by an unclean shutdown, marked as FAILED",
                );
            }
            fs::remove_file(entry.path())?;
        }
        Ok(())
    }

    /// Build ids waiting in `new/`, oldest first.
    pub fn waiting(&self) -> Vec<String> {
        list_queue_dir(&self.new_dir())
    }

    /// Build ids currently in `run/`.
    pub fn running(&self) -> Vec<String> {
        list_queue_dir(&self.run_dir())
    }

    /// Status summaries for every build whose status satisfies `want`.
    pub fn builds_with_status(&self, want: impl Fn(BuildStatus) -> bool) -> Vec<ComposeStatus> {
        let Ok(entries) = fs::read_dir(self.lib_dir.join("results")) else {
            return Vec::new();
        };
        let mut builds: Vec<ComposeStatus> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let uuid = e.file_name().to_string_lossy().to_string();
                self.status(&uuid).ok()
            })
            .filter(|s| want(s.queue_status))
            .collect();
        builds.sort_by(|a, b| a.id.cmp(&b.id));
        builds
    }

    fn checked_results_dir(&self, uuid: &str) -> Result<PathBuf, QueueError> {
        // Build ids are uuids; reject anything else before it touches the
        // filesystem.
        if Uuid::parse_str(uuid).is_err() {
            return Err(QueueError::UnknownUuid(uuid.to_string()));
        }
        let dir = self.results_dir(uuid);
        if !dir.is_dir() {
            return Err(QueueError::UnknownUuid(uuid.to_string()));
        }
        Ok(dir)
    }

    /// The compose type of a build, derived from the template copied into
    /// its result directory (the one `.ks` that is not the final
    /// kickstart).
    pub fn compose_type(&self, results_dir: &Path) -> Option<String> {
        let entries = fs::read_dir(results_dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".ks"))
                    .map(|n| n.to_string())
            })
            .find(|n| n != "final-kickstart")
    }

    /// Status summary for one build. Sizes are read after `STATUS` so a
    /// partially-written result is never over-reported.
    pub fn status(&self, uuid: &str) -> Result<ComposeStatus, QueueError> {
        let results = self.checked_results_dir(uuid)?;
        let queue_status =
            read_status(&results).ok_or_else(|| QueueError::UnknownUuid(uuid.to_string()))?;

        let blueprint = self.read_blueprint(&results);
        let (name, version) = blueprint
            .map(|bp| (bp.name, bp.version))
            .unwrap_or_default();
        let compose_type = self.compose_type(&results).unwrap_or_default();

        Ok(ComposeStatus {
            id: uuid.to_string(),
            blueprint: name,
            version,
            compose_type,
            image_size: self.image_size(&results),
            queue_status,
            job_created: read_timestamp(&results, TS_CREATED),
            job_started: read_timestamp(&results, TS_STARTED),
            job_finished: read_timestamp(&results, TS_FINISHED),
        })
    }

    /// Detailed info for one build.
    pub fn info(&self, uuid: &str) -> Result<ComposeInfo, QueueError> {
        let results = self.checked_results_dir(uuid)?;
        let queue_status =
            read_status(&results).ok_or_else(|| QueueError::UnknownUuid(uuid.to_string()))?;
        let config: BuilderConfig =
            toml::from_str(&fs::read_to_string(results.join("config.toml"))?)?;
        let blueprint = self
            .read_blueprint(&results)
            .ok_or_else(|| QueueError::UnknownUuid(uuid.to_string()))?;
        let commit = fs::read_to_string(results.join("COMMIT"))
            .unwrap_or_default()
            .trim()
            .to_string();
        let deps: DepsList = fs::read_to_string(results.join("deps.toml"))
            .ok()
            .and_then(|text| toml::from_str(&text).ok())
            .unwrap_or_default();

        Ok(ComposeInfo {
            id: uuid.to_string(),
            compose_type: self.compose_type(&results).unwrap_or_default(),
            image_size: self.image_size(&results),
            config,
            blueprint,
            commit,
            deps,
            queue_status,
        })
    }

    fn read_blueprint(&self, results_dir: &Path) -> Option<Blueprint> {
        let text = fs::read_to_string(results_dir.join("blueprint.toml")).ok()?;
        Blueprint::from_toml(&text).ok()
    }

    /// Size of the produced image, 0 until one exists.
    fn image_size(&self, results_dir: &Path) -> u64 {
        let Ok(text) = fs::read_to_string(results_dir.join("config.toml")) else {
            return 0;
        };
        let Ok(config) = toml::from_str::<BuilderConfig>(&text) else {
            return 0;
        };
        fs::metadata(results_dir.join(&config.compose.image_name))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Cancel a waiting or running build.
    ///
    /// Waiting builds are pulled out of `new/` and marked CANCELED here.
    /// Running builds get their builder process group terminated; the
    /// worker's exit path observes the cancellation marker and writes the
    /// final status. Terminal builds cannot be canceled.
    pub fn cancel(&self, uuid: &str) -> Result<(), QueueError> {
        let results = self.checked_results_dir(uuid)?;
        let status =
            read_status(&results).ok_or_else(|| QueueError::UnknownUuid(uuid.to_string()))?;
        match status {
            BuildStatus::Waiting => {
                // Removing the symlink races with the worker picking the
                // build up; the worker re-checks STATUS before starting.
                let link = self.new_dir().join(uuid);
                if link.symlink_metadata().is_ok() {
                    fs::remove_file(link)?;
                }
                write_status(&results, BuildStatus::Canceled)?;
                info!(build = %uuid, "canceled waiting build");
                Ok(())
            }
            BuildStatus::Running => {
                fs::write(results.join(CANCEL_MARKER), "")?;
                if let Some(pid) = read_pid(&results) {
                    worker::terminate_process_group(pid);
                }
                info!(build = %uuid, "canceled running build");
                Ok(())
            }
            other => Err(QueueError::WrongState {
                uuid: uuid.to_string(),
                expected: "WAITING or RUNNING",
                actual: other,
            }),
        }
    }

    /// Delete a finished build's result directory. Waiting and running
    /// builds must be canceled first.
    pub fn delete(&self, uuid: &str) -> Result<(), QueueError> {
        let results = self.checked_results_dir(uuid)?;
        let status =
            read_status(&results).ok_or_else(|| QueueError::UnknownUuid(uuid.to_string()))?;
        if !status.is_terminal() {
            return Err(QueueError::WrongState {
                uuid: uuid.to_string(),
                expected: "FINISHED, FAILED, or CANCELED",
                actual: status,
            });
        }
        fs::remove_dir_all(&results)?;
        info!(build = %uuid, "deleted build results");
        Ok(())
    }
}

fn read_pid(results_dir: &Path) -> Option<u32> {
    fs::read_to_string(results_dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Queue entries sorted by symlink creation order (mtime, then name so ties
/// stay stable).
fn list_queue_dir(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut links: Vec<(std::time::SystemTime, String)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let mtime = e
                .path()
                .symlink_metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            Some((mtime, e.file_name().to_str()?.to_string()))
        })
        .collect();
    links.sort();
    links.into_iter().map(|(_, name)| name).collect()
}

pub(crate) fn append_queue_log(results_dir: &Path, message: &str) {
    use std::io::Write;
    let logs = results_dir.join("logs");
    if fs::create_dir_all(&logs).is_err() {
        return;
    }
    if let Ok(mut file) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs.join("queue.log"))
    {
        let _ = writeln!(file, "{} {message}", chrono::Utc::now().to_rfc3339());
    } else {
        warn!(results = %results_dir.display(), "could not append to queue log");
    }
}
