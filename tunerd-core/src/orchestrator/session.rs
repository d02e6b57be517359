use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use chrono::Utc;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::catalog::{ranking, ChannelCatalog, ChannelRecord};
use crate::config::TunerdConfig;
use crate::resolver::StreamUrlResolver;

use super::error::{OrchestratorError, OrchestratorResult};
use super::events::{KillReason, SessionEvent, SessionStatus};
use super::recovery::force_kill;
use super::ProcessLauncher;

const SESSION_LOG_NAME: &str = "session.log";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Map a channel display name to an exclusive directory name. Distinct
/// names that sanitize identically would collide, but the registry keys on
/// the original name so at most one session ever owns the directory.
pub fn sanitize_channel_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One live channel: the capture and encode subprocesses chained by a byte
/// pipe, their supervising timer, the log sink, and lifecycle state. All
/// teardown paths funnel through [`Session::teardown`], which is idempotent
/// via the one-way `killed` flag.
pub struct Session {
    channel_name: String,
    dir: PathBuf,
    playlist_path: PathBuf,
    config: Arc<TunerdConfig>,
    started_at: OnceLock<Instant>,
    last_access: Mutex<Instant>,
    /// Active viewer references; incremented on every successful join,
    /// decremented by close. Teardown once it reaches zero.
    viewers: AtomicI64,
    killed: AtomicBool,
    pids: Mutex<Vec<u32>>,
    events: broadcast::Sender<SessionEvent>,
    log: Mutex<Option<std::fs::File>>,
    sessions: Weak<Mutex<HashMap<String, Arc<Session>>>>,
}

impl Session {
    /// Open a pipeline for `channel_name`: rank the catalog's candidate
    /// sources and walk them in order until one survives the grace window.
    /// Returns an error without registering anything when the catalog is
    /// empty or every candidate dies early.
    pub(crate) async fn open(
        channel_name: &str,
        config: Arc<TunerdConfig>,
        catalog: &dyn ChannelCatalog,
        resolver: &dyn StreamUrlResolver,
        launcher: &dyn ProcessLauncher,
        sessions: Weak<Mutex<HashMap<String, Arc<Session>>>>,
    ) -> OrchestratorResult<Arc<Session>> {
        let records = catalog.records_by_name(channel_name);
        if records.is_empty() {
            return Err(OrchestratorError::NoSources(channel_name.to_string()));
        }
        let candidates = ranking::rank(records);
        let candidate_count = candidates.len();

        let dir = config
            .session_root()
            .join(sanitize_channel_name(channel_name));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| OrchestratorError::Io {
                source,
                path: dir.clone(),
            })?;
        let playlist_path = dir.join(&config.pipeline.manifest_name);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(SESSION_LOG_NAME))
            .map_err(|error| {
                warn!(channel = channel_name, %error, "failed to open session log");
                error
            })
            .ok();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let session = Arc::new(Session {
            channel_name: channel_name.to_string(),
            dir,
            playlist_path,
            config,
            started_at: OnceLock::new(),
            last_access: Mutex::new(Instant::now()),
            viewers: AtomicI64::new(0),
            killed: AtomicBool::new(false),
            pids: Mutex::new(Vec::new()),
            events,
            log: Mutex::new(log),
            sessions,
        });

        for record in candidates {
            let url = resolver.resolve(&record.url).await;
            match session.try_candidate(&url, launcher).await {
                Ok(Some((capture, encode))) => {
                    info!(
                        channel = channel_name,
                        source = %record.id,
                        score = record.score,
                        "pipeline opened"
                    );
                    session.accept(&record, capture, encode).await;
                    return Ok(session);
                }
                Ok(None) => {
                    warn!(
                        channel = channel_name,
                        source = %record.id,
                        score = record.score,
                        "candidate pipeline died within grace window, trying next"
                    );
                    session.log_line(&format!(
                        "candidate {} ({url}) died within grace window",
                        record.id
                    ));
                }
                Err(error) => {
                    session.log_line(&format!(
                        "candidate {} ({url}) failed to start: {error}",
                        record.id
                    ));
                    session.discard().await;
                    return Err(error);
                }
            }
        }

        session.log_line("no candidate source survived, giving up");
        session.discard().await;
        Err(OrchestratorError::AllCandidatesFailed {
            channel: channel_name.to_string(),
            candidates: candidate_count,
        })
    }

    /// Drop the log handle and remove the output directory of a session
    /// that never reached the running state.
    async fn discard(&self) {
        *self.log.lock().unwrap() = None;
        if let Err(error) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!(path = %self.dir.display(), %error, "failed to remove session directory");
        }
    }

    /// Spawn capture and encode chained by a pipe, then wait out the grace
    /// window. `Ok(None)` means both subprocesses already exited and the
    /// next candidate should be tried.
    async fn try_candidate(
        &self,
        url: &str,
        launcher: &dyn ProcessLauncher,
    ) -> OrchestratorResult<Option<(Child, Child)>> {
        let pipeline = &self.config.pipeline;
        let quality = pipeline.quality_selector();

        let mut capture_cmd = Command::new(&pipeline.capture_bin);
        for arg in &pipeline.capture_args {
            capture_cmd.arg(arg.replace("{url}", url).replace("{quality}", &quality));
        }
        capture_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut capture =
            launcher
                .spawn(&mut capture_cmd)
                .await
                .map_err(|source| OrchestratorError::Spawn {
                    program: pipeline.capture_bin.clone(),
                    source,
                })?;

        let capture_stdout = capture
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::Spawn {
                program: pipeline.capture_bin.clone(),
                source: std::io::Error::other("capture stdout was not piped"),
            })?;
        let encode_stdin: Stdio =
            capture_stdout
                .try_into()
                .map_err(|source| OrchestratorError::Spawn {
                    program: pipeline.capture_bin.clone(),
                    source,
                })?;

        let playlist = self.playlist_path.to_string_lossy().to_string();
        let segments = self
            .dir
            .join(format!("segment_%05d.{}", pipeline.segment_ext))
            .to_string_lossy()
            .to_string();
        let mut encode_cmd = Command::new(&pipeline.encode_bin);
        for arg in &pipeline.encode_args {
            encode_cmd.arg(
                arg.replace("{playlist}", &playlist)
                    .replace("{segments}", &segments),
            );
        }
        encode_cmd
            .current_dir(&self.dir)
            .stdin(encode_stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut encode = match launcher.spawn(&mut encode_cmd).await {
            Ok(child) => child,
            Err(source) => {
                let _ = capture.start_kill();
                let _ = capture.wait().await;
                return Err(OrchestratorError::Spawn {
                    program: pipeline.encode_bin.clone(),
                    source,
                });
            }
        };

        tokio::time::sleep(self.config.grace_window()).await;
        let capture_exited = matches!(capture.try_wait(), Ok(Some(_)));
        let encode_exited = matches!(encode.try_wait(), Ok(Some(_)));
        if capture_exited && encode_exited {
            return Ok(None);
        }
        Ok(Some((capture, encode)))
    }

    /// Promote a surviving pipeline to the running state: record timestamps,
    /// persist the crash-recovery PID marker, and start log forwarding, exit
    /// watchers and the supervisor timer.
    async fn accept(self: &Arc<Self>, record: &ChannelRecord, mut capture: Child, mut encode: Child) {
        let _ = self.started_at.set(Instant::now());
        self.touch();
        // The creating viewer counts as the first reference.
        self.viewers.store(1, Ordering::SeqCst);

        let capture_pid = capture.id();
        let encode_pid = encode.id();
        {
            let mut pids = self.pids.lock().unwrap();
            pids.extend(capture_pid);
            pids.extend(encode_pid);
        }
        let marker = self.pid_marker_path();
        let contents: String = [capture_pid, encode_pid]
            .iter()
            .flatten()
            .map(|pid| format!("{pid}\n"))
            .collect();
        if let Err(error) = tokio::fs::write(&marker, contents).await {
            warn!(path = %marker.display(), %error, "failed to write pid marker");
        }

        self.log_line(&format!(
            "session opened from source {} (capture pid {:?}, encode pid {:?})",
            record.id, capture_pid, encode_pid
        ));

        if let Some(stderr) = capture.stderr.take() {
            self.spawn_log_forwarder("capture", stderr);
        }
        if let Some(stderr) = encode.stderr.take() {
            self.spawn_log_forwarder("encode", stderr);
        }
        self.spawn_exit_watcher("capture", capture);
        self.spawn_exit_watcher("encode", encode);
        self.spawn_supervisor();
    }

    fn spawn_log_forwarder(self: &Arc<Self>, stage: &'static str, stderr: ChildStderr) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                session.log_line(&format!("[{stage}] {line}"));
                let _ = session
                    .events
                    .send(SessionEvent::Log { lines: vec![line] });
            }
        });
    }

    fn spawn_exit_watcher(self: &Arc<Self>, stage: &'static str, mut child: Child) {
        let session = Arc::clone(self);
        let pid = child.id();
        tokio::spawn(async move {
            let status = child.wait().await;
            // The pid is reaped now and may be recycled by an unrelated
            // process; make sure teardown never signals it again.
            if let Some(pid) = pid {
                session.pids.lock().unwrap().retain(|candidate| *candidate != pid);
            }
            if session.is_killed() {
                return;
            }
            let (code, signal) = match &status {
                Ok(status) => (status.code(), status.signal()),
                Err(_) => (None, None),
            };
            warn!(
                channel = %session.channel_name,
                stage,
                ?code,
                ?signal,
                "pipeline subprocess exited"
            );
            session
                .teardown(KillReason::ProcessExit { code, signal })
                .await;
        });
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let timeout = self.config.inactivity_timeout();
        let tick = self.config.supervisor_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if session.is_killed() {
                    break;
                }
                let idle = { session.last_access.lock().unwrap().elapsed() };
                if idle > timeout {
                    info!(
                        channel = %session.channel_name,
                        idle_secs = idle.as_secs(),
                        "no viewer activity past timeout"
                    );
                    session.teardown(KillReason::Inactivity).await;
                    break;
                }
                let status = session.compute_status().await;
                let _ = session.events.send(SessionEvent::Status(status));
            }
        });
    }

    /// List the output directory and derive the viewer-facing readiness
    /// snapshot published on each supervisor tick.
    pub(crate) async fn compute_status(&self) -> SessionStatus {
        let pipeline = &self.config.pipeline;
        let segment_suffix = format!(".{}", pipeline.segment_ext);
        let mut segment_count = 0;
        let mut manifest_exists = false;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name == pipeline.manifest_name {
                    manifest_exists = true;
                } else if name.ends_with(&segment_suffix) {
                    segment_count += 1;
                }
            }
        }
        let elapsed = self
            .started_at
            .get()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let ready = manifest_exists && segment_count >= self.config.limits.min_ready_segments;
        let progress_percent = if ready {
            100
        } else {
            let estimate = self.config.limits.startup_estimate_secs.max(1);
            (elapsed.as_secs() * 100 / estimate).min(99) as u8
        };
        SessionStatus {
            ready,
            segment_count,
            manifest_exists,
            progress_percent,
            elapsed_seconds: elapsed.as_secs(),
            playlist_url: self.playlist_path.to_string_lossy().to_string(),
        }
    }

    /// Tear the session down: kill both subprocesses, notify subscribers,
    /// schedule deferred registry release and remove the output directory.
    /// Idempotent; only the first caller acts.
    pub(crate) async fn teardown(self: &Arc<Self>, reason: KillReason) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(channel = %self.channel_name, reason = %reason, "tearing down session");
        let _ = self.events.send(SessionEvent::Killed {
            channel_name: self.channel_name.clone(),
            reason: reason.to_string(),
        });

        let pids: Vec<u32> = self.pids.lock().unwrap().drain(..).collect();
        for pid in pids {
            if force_kill(pid) {
                debug!(pid, "killed pipeline subprocess");
            }
        }

        self.schedule_release();

        self.log_line(&format!("session closed: {reason}"));
        *self.log.lock().unwrap() = None;

        if let Err(error) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!(path = %self.dir.display(), %error, "failed to remove session directory");
        }
    }

    /// Defer removal from the registry map by the tuner-release delay so an
    /// immediate re-request does not race a still-draining upstream
    /// connection. Removal only happens if the map still holds this exact
    /// session.
    pub(crate) fn schedule_release(self: &Arc<Self>) {
        let sessions = self.sessions.clone();
        let name = self.channel_name.clone();
        let delay = self.config.tuner_release_delay();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(map) = sessions.upgrade() {
                let mut map = map.lock().unwrap();
                let same = map
                    .get(&name)
                    .map(|entry| Arc::ptr_eq(entry, &session))
                    .unwrap_or(false);
                if same {
                    map.remove(&name);
                    debug!(channel = %name, "tuner released");
                }
            }
        });
    }

    /// Viewer keep-alive.
    pub(crate) fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    /// Count one more viewer sharing this tuner.
    pub(crate) fn join(&self) {
        self.viewers.fetch_add(1, Ordering::SeqCst);
    }

    /// Viewer-initiated stop. The viewer count never goes below zero; the
    /// session is torn down once the last viewer leaves.
    pub(crate) async fn close(self: &Arc<Self>) {
        let previous = self
            .viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1).max(0))
            })
            .unwrap_or(0);
        if previous <= 1 {
            self.teardown(KillReason::Closed).await;
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn playlist_path(&self) -> &Path {
        &self.playlist_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn viewer_count(&self) -> i64 {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Subprocess pids still owned by this session; reaped or killed ones
    /// drop out.
    pub fn recorded_pids(&self) -> Vec<u32> {
        self.pids.lock().unwrap().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn pid_marker_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.pid", self.config.pipeline.manifest_name))
    }

    fn log_line(&self, line: &str) {
        if let Some(file) = self.log.lock().unwrap().as_mut() {
            let _ = writeln!(
                file,
                "{} {line}",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ")
            );
        }
    }
}
