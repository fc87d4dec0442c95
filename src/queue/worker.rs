//! Queue worker
//!
//! A single worker drives the queue: it moves the oldest `new/` symlink to
//! `run/`, runs the downstream image builder as a sub-process in its own
//! process group (streaming its output into the build's `logs/` directory),
//! sorts the produced artifact into the result directory, and records the
//! final status. Test modes short-circuit the builder so the queue paths
//! can be exercised without an installer.

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::compose::{BuilderConfig, ComposeArgs};
use crate::config::Config;

use super::{
    append_queue_log, read_status, write_status, write_timestamp, BuildStatus, Queue,
    CANCEL_MARKER, PID_FILE, TS_FINISHED, TS_STARTED,
};

/// How long a terminated builder gets before the process group is killed.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Builder poll interval while waiting for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

enum Outcome {
    Finished,
    Failed,
}

pub struct Worker {
    cfg: Arc<Config>,
    queue: Queue,
}

impl Worker {
    pub fn new(cfg: Arc<Config>, queue: Queue) -> Self {
        Self { cfg, queue }
    }

    /// The worker loop. Polls `new/` until `running` is cleared; builds run
    /// to completion before shutdown is honored.
    pub fn run(&self, running: &AtomicBool) {
        info!("compose worker started");
        while running.load(Ordering::SeqCst) {
            if !self.process_next() {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        info!("compose worker stopped");
    }

    /// Pick up and run the oldest waiting build. Returns false when the
    /// queue is empty.
    pub fn process_next(&self) -> bool {
        let Some(uuid) = self.queue.waiting().into_iter().next() else {
            return false;
        };
        let new_link = self.queue.new_dir().join(&uuid);
        let run_link = self.queue.run_dir().join(&uuid);
        // The move is atomic; losing the race to a cancel just skips the
        // entry.
        if let Err(e) = fs::rename(&new_link, &run_link) {
            debug!(build = %uuid, error = %e, "queue entry vanished before pickup");
            return true;
        }
        self.run_build(&uuid, &run_link);
        true
    }

    fn run_build(&self, uuid: &str, run_link: &Path) {
        let results = self.queue.results_dir(uuid);

        // A cancel may have landed between enqueue and pickup.
        if read_status(&results) != Some(BuildStatus::Waiting) {
            warn!(build = %uuid, "skipping build, no longer WAITING");
            let _ = fs::remove_file(run_link);
            return;
        }

        info!(build = %uuid, "starting build");
        if let Err(e) = write_status(&results, BuildStatus::Running)
            .and_then(|_| write_timestamp(&results, TS_STARTED))
        {
            error!(build = %uuid, error = %e, "cannot mark build running");
            let _ = fs::remove_file(run_link);
            return;
        }
        let _ = fs::create_dir_all(results.join("logs"));

        let outcome = match test_mode(&results) {
            1 => {
                append_queue_log(&results, "test mode 1: failing the build");
                Outcome::Failed
            }
            2 => {
                append_queue_log(&results, "test mode 2: finishing the build");
                self.write_fake_artifact(&results);
                Outcome::Finished
            }
            _ => self.run_builder(&results),
        };

        let canceled = results.join(CANCEL_MARKER).exists();
        let status = match (canceled, outcome) {
            (true, _) => BuildStatus::Canceled,
            (false, Outcome::Finished) => BuildStatus::Finished,
            (false, Outcome::Failed) => BuildStatus::Failed,
        };
        if let Err(e) = write_status(&results, status) {
            error!(build = %uuid, error = %e, "cannot write final status");
        }
        let _ = write_timestamp(&results, TS_FINISHED);
        let _ = fs::remove_file(results.join(PID_FILE));
        let _ = fs::remove_file(run_link);
        info!(build = %uuid, %status, "build finished");
    }

    fn write_fake_artifact(&self, results: &Path) {
        if let Some(config) = read_config(results) {
            let _ = fs::write(results.join(&config.compose.image_name), "TEST IMAGE");
        }
    }

    /// Run the image builder for one build and sort its output.
    fn run_builder(&self, results: &Path) -> Outcome {
        let Some(config) = read_config(results) else {
            append_queue_log(results, "missing or unreadable config.toml");
            return Outcome::Failed;
        };

        let stdout = match log_file(results, "program.log") {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "cannot open builder log");
                return Outcome::Failed;
            }
        };
        let stderr = stdout.try_clone().ok().map(Stdio::from);

        let mut command = Command::new(&self.cfg.builder.command);
        command
            .arg("--config")
            .arg(results.join("config.toml"))
            .arg("--results")
            .arg(results)
            .current_dir(results)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(stderr.unwrap_or_else(Stdio::null))
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(builder = %self.cfg.builder.command.display(), error = %e,
                       "failed to start image builder");
                append_queue_log(results, &format!("failed to start image builder: {e}"));
                return Outcome::Failed;
            }
        };
        let _ = fs::write(results.join(PID_FILE), child.id().to_string());
        debug!(pid = child.id(), "image builder running");

        let deadline = Instant::now() + Duration::from_secs(config.timeout * 60);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(timeout = config.timeout, "builder timed out, killing it");
                        append_queue_log(results, "builder timed out");
                        terminate_process_group(child.id());
                        let _ = child.wait();
                        return Outcome::Failed;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    error!(error = %e, "waiting for builder failed");
                    return Outcome::Failed;
                }
            }
        };

        if !status.success() {
            append_queue_log(results, &format!("builder exited with {status}"));
            return Outcome::Failed;
        }
        match move_compose_results(&config.compose, results) {
            Ok(()) => Outcome::Finished,
            Err(e) => {
                error!(error = %e, "collecting build artifact failed");
                append_queue_log(results, &format!("collecting build artifact failed: {e}"));
                Outcome::Failed
            }
        }
    }
}

fn test_mode(results: &Path) -> u32 {
    fs::read_to_string(results.join("TEST"))
        .ok()
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(0)
}

fn read_config(results: &Path) -> Option<BuilderConfig> {
    let text = fs::read_to_string(results.join("config.toml")).ok()?;
    toml::from_str(&text).ok()
}

fn log_file(results: &Path, name: &str) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(results.join("logs").join(name))
}

/// Move the produced image into the result directory and prune the
/// builder's scratch directory - but only when its base name is `compose`,
/// as a guard against misconfigured targets.
fn move_compose_results(compose: &ComposeArgs, results: &Path) -> std::io::Result<()> {
    let scratch = results.join("compose");

    if compose.make_tar {
        rename_artifact(&scratch.join(&compose.image_name), &results.join(&compose.image_name))?;
    } else if compose.make_iso {
        // The iso builder always produces images/boot.iso; rename it to the
        // type's image name.
        let boot_iso = scratch.join("images").join("boot.iso");
        let source = if boot_iso.exists() {
            boot_iso
        } else {
            scratch.join("boot.iso")
        };
        rename_artifact(&source, &results.join(&compose.image_name))?;
    } else if compose.make_disk || compose.make_fsimage {
        rename_artifact(&scratch.join(&compose.image_name), &results.join(&compose.image_name))?;
    }

    if scratch.file_name().map(|n| n == "compose").unwrap_or(false) {
        fs::remove_dir_all(&scratch)?;
    } else {
        error!(scratch = %scratch.display(), "incorrect compose directory, not cleaning up");
    }
    Ok(())
}

fn rename_artifact(source: &Path, dest: &Path) -> std::io::Result<()> {
    if !source.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("builder did not produce {}", source.display()),
        ));
    }
    fs::rename(source, dest)
}

/// Terminate a builder's process group: SIGTERM first, SIGKILL after a
/// grace period if the leader is still alive.
pub fn terminate_process_group(pid: u32) {
    let pgid = -(pid as i32);
    unsafe {
        libc::kill(pgid, libc::SIGTERM);
    }
    std::thread::sleep(TERM_GRACE);
    let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
    if alive {
        warn!(pid, "builder ignored SIGTERM, killing the process group");
        unsafe {
            libc::kill(pgid, libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::compose_args;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn write_config(results: &Path, compose_type: &str) {
        let mut compose = compose_args(compose_type).unwrap();
        compose.compression = Some("xz".to_string());
        compose.compress_args = Some(Vec::new());
        let config = BuilderConfig {
            compose,
            title: String::new(),
            project: String::new(),
            releasever: String::new(),
            volid: String::new(),
            extra_boot_args: String::new(),
            ks: vec![results.join("final-kickstart.ks").display().to_string()],
            logfile: results.join("logs").display().to_string(),
            timeout: 1,
        };
        fs::write(results.join("config.toml"), toml::to_string(&config).unwrap()).unwrap();
    }

    fn queued_build(queue: &Queue, compose_type: &str, test_mode: Option<u32>) -> String {
        let uuid = Uuid::new_v4().to_string();
        let results = queue.results_dir(&uuid);
        fs::create_dir_all(&results).unwrap();
        fs::write(
            results.join("blueprint.toml"),
            "name = \"example\"\nversion = \"0.0.1\"\n",
        )
        .unwrap();
        fs::write(results.join(format!("{compose_type}.ks")), "%packages\n").unwrap();
        write_config(&results, compose_type);
        if let Some(mode) = test_mode {
            fs::write(results.join("TEST"), mode.to_string()).unwrap();
        }
        write_status(&results, BuildStatus::Waiting).unwrap();
        std::os::unix::fs::symlink(&results, queue.new_dir().join(&uuid)).unwrap();
        uuid
    }

    fn worker_with_builder(dir: &TempDir, script: &str) -> (Worker, Queue) {
        let queue = Queue::open(dir.path()).unwrap();
        let builder = dir.path().join("fake-builder.sh");
        fs::write(&builder, script).unwrap();
        let mut perms = fs::metadata(&builder).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&builder, perms).unwrap();

        let mut cfg = Config::default();
        cfg.paths.lib_dir = dir.path().to_path_buf();
        cfg.builder.command = builder;
        (Worker::new(Arc::new(cfg), queue.clone()), queue)
    }

    #[test]
    fn empty_queue_processes_nothing() {
        let dir = TempDir::new().unwrap();
        let (worker, _queue) = worker_with_builder(&dir, "#!/bin/sh\nexit 0\n");
        assert!(!worker.process_next());
    }

    #[test]
    fn test_mode_two_finishes_with_fake_artifact() {
        let dir = TempDir::new().unwrap();
        let (worker, queue) = worker_with_builder(&dir, "#!/bin/sh\nexit 1\n");
        let uuid = queued_build(&queue, "qcow2", Some(2));

        assert!(worker.process_next());
        let status = queue.status(&uuid).unwrap();
        assert_eq!(status.queue_status, BuildStatus::Finished);
        assert!(status.job_started.is_some());
        assert!(status.job_finished.is_some());
        assert!(queue.results_dir(&uuid).join("disk.qcow2").exists());
        assert!(queue.running().is_empty());
    }

    #[test]
    fn test_mode_one_fails_quickly() {
        let dir = TempDir::new().unwrap();
        let (worker, queue) = worker_with_builder(&dir, "#!/bin/sh\nexit 0\n");
        let uuid = queued_build(&queue, "qcow2", Some(1));

        assert!(worker.process_next());
        assert_eq!(
            queue.status(&uuid).unwrap().queue_status,
            BuildStatus::Failed
        );
    }

    #[test]
    fn successful_builder_run_moves_artifact_and_prunes_scratch() {
        let dir = TempDir::new().unwrap();
        let (worker, queue) = worker_with_builder(
            &dir,
            "#!/bin/sh\nmkdir -p compose\necho fake-disk > compose/disk.qcow2\nexit 0\n",
        );
        let uuid = queued_build(&queue, "qcow2", None);

        assert!(worker.process_next());
        let results = queue.results_dir(&uuid);
        assert_eq!(
            queue.status(&uuid).unwrap().queue_status,
            BuildStatus::Finished
        );
        assert_eq!(
            fs::read_to_string(results.join("disk.qcow2")).unwrap().trim(),
            "fake-disk"
        );
        // Scratch dir was pruned after a successful run.
        assert!(!results.join("compose").exists());
        // Builder output was captured.
        assert!(results.join("logs/program.log").exists());
        assert!(queue.status(&uuid).unwrap().image_size > 0);
    }

    #[test]
    fn failing_builder_keeps_scratch_for_postmortem() {
        let dir = TempDir::new().unwrap();
        let (worker, queue) = worker_with_builder(
            &dir,
            "#!/bin/sh\nmkdir -p compose\necho partial > compose/disk.qcow2\necho boom >&2\nexit 1\n",
        );
        let uuid = queued_build(&queue, "qcow2", None);

        assert!(worker.process_next());
        let results = queue.results_dir(&uuid);
        assert_eq!(
            queue.status(&uuid).unwrap().queue_status,
            BuildStatus::Failed
        );
        assert!(results.join("compose/disk.qcow2").exists());
        let log = fs::read_to_string(results.join("logs/program.log")).unwrap();
        assert!(log.contains("boom"));
    }

    #[test]
    fn live_iso_boot_iso_is_renamed() {
        let dir = TempDir::new().unwrap();
        let (worker, queue) = worker_with_builder(
            &dir,
            "#!/bin/sh\nmkdir -p compose/images\necho iso > compose/images/boot.iso\nexit 0\n",
        );
        let uuid = queued_build(&queue, "live-iso", None);

        assert!(worker.process_next());
        let results = queue.results_dir(&uuid);
        assert_eq!(
            queue.status(&uuid).unwrap().queue_status,
            BuildStatus::Finished
        );
        assert!(results.join("live.iso").exists());
    }

    #[test]
    fn canceled_before_pickup_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (worker, queue) = worker_with_builder(&dir, "#!/bin/sh\nexit 0\n");
        let uuid = queued_build(&queue, "qcow2", Some(2));
        queue.cancel(&uuid).unwrap();

        // A racing pickup of the canceled entry does not run the build.
        let results = queue.results_dir(&uuid);
        std::os::unix::fs::symlink(&results, queue.new_dir().join(&uuid)).unwrap();
        assert!(worker.process_next());
        assert_eq!(
            queue.status(&uuid).unwrap().queue_status,
            BuildStatus::Canceled
        );
        assert!(queue.running().is_empty());
    }

    #[test]
    fn statuses_never_revert() {
        let dir = TempDir::new().unwrap();
        let (worker, queue) = worker_with_builder(&dir, "#!/bin/sh\nexit 0\n");
        let uuid = queued_build(&queue, "qcow2", Some(2));
        assert!(worker.process_next());
        assert_eq!(
            queue.status(&uuid).unwrap().queue_status,
            BuildStatus::Finished
        );
        // A second pickup attempt of the same uuid does nothing.
        std::os::unix::fs::symlink(queue.results_dir(&uuid), queue.new_dir().join(&uuid)).unwrap();
        assert!(worker.process_next());
        assert_eq!(
            queue.status(&uuid).unwrap().queue_status,
            BuildStatus::Finished
        );
    }
}
