//! Startup crash recovery: session directories left behind by a previous
//! run are untrusted, so any subprocess still listed in a PID marker is
//! killed and the directory is removed before the registry accepts
//! requests.

use std::io::ErrorKind;
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub scanned_dirs: usize,
    pub killed_pids: Vec<u32>,
    pub removed_dirs: usize,
    pub errors: usize,
}

/// Probe whether a process exists without sending it a signal.
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub(crate) fn force_kill(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok()
}

/// Scan every subdirectory of the session root, kill leftover subprocesses
/// named by the sidecar PID marker, and delete the directory. Failures are
/// logged per directory and never abort the rest of the scan.
pub async fn first_run_cleanup(session_root: &Path, manifest_name: &str) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let mut entries = match tokio::fs::read_dir(session_root).await {
        Ok(entries) => entries,
        Err(error) => {
            debug!(
                path = %session_root.display(),
                %error,
                "session root not readable, nothing to recover"
            );
            return report;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "failed to list session root entry");
                report.errors += 1;
                break;
            }
        };
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map(|kind| kind.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        report.scanned_dirs += 1;

        let marker = path.join(format!("{manifest_name}.pid"));
        match tokio::fs::read_to_string(&marker).await {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(pid) = line.parse::<u32>() else {
                        warn!(path = %marker.display(), line, "unparseable pid in marker");
                        report.errors += 1;
                        continue;
                    };
                    if !pid_alive(pid) {
                        debug!(pid, "leftover pid already dead");
                        continue;
                    }
                    if force_kill(pid) {
                        info!(pid, dir = %path.display(), "killed leftover subprocess");
                        report.killed_pids.push(pid);
                    } else {
                        warn!(pid, "failed to kill leftover subprocess");
                        report.errors += 1;
                    }
                }
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(dir = %path.display(), "no pid marker, removing directory anyway");
            }
            Err(error) => {
                warn!(path = %marker.display(), %error, "failed to read pid marker");
                report.errors += 1;
            }
        }

        // Manifest and segments cannot be trusted after a restart.
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => report.removed_dirs += 1,
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to remove stale session dir");
                report.errors += 1;
            }
        }
    }

    info!(
        scanned = report.scanned_dirs,
        removed = report.removed_dirs,
        killed = report.killed_pids.len(),
        errors = report.errors,
        "startup session cleanup complete"
    );
    report
}
