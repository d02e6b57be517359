pub mod error;
pub mod events;
pub mod recovery;
mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::info;

use crate::catalog::ChannelCatalog;
use crate::config::TunerdConfig;
use crate::resolver::StreamUrlResolver;

pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{KillReason, SessionEvent, SessionStatus};
pub use recovery::{first_run_cleanup, pid_alive, RecoveryReport};
pub use session::{sanitize_channel_name, Session};

type SessionMap = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// Seam for spawning the capture/encode subprocesses, injectable in tests.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, command: &mut Command) -> std::io::Result<Child>;
}

#[derive(Debug, Default)]
pub struct SystemProcessLauncher;

#[async_trait]
impl ProcessLauncher for SystemProcessLauncher {
    async fn spawn(&self, command: &mut Command) -> std::io::Result<Child> {
        command.spawn()
    }
}

/// What a request handler needs to serve the stream: where the manifest
/// will appear.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub channel_name: String,
    pub playlist_path: PathBuf,
}

/// Process-wide session registry and admission control: at most one live
/// session per channel name, and no more than `max_streams` sessions in
/// total. Creation for a name is serialized by a creation mutex held only
/// across construct+open, so unrelated channels still open concurrently
/// with a running session's lifetime.
pub struct StreamOrchestrator {
    config: Arc<TunerdConfig>,
    catalog: Arc<dyn ChannelCatalog>,
    resolver: Arc<dyn StreamUrlResolver>,
    launcher: Arc<dyn ProcessLauncher>,
    sessions: SessionMap,
    create_lock: tokio::sync::Mutex<()>,
    cleanup_done: AtomicBool,
}

impl StreamOrchestrator {
    pub fn new(
        config: TunerdConfig,
        catalog: Arc<dyn ChannelCatalog>,
        resolver: Arc<dyn StreamUrlResolver>,
        launcher: Option<Arc<dyn ProcessLauncher>>,
    ) -> Self {
        let launcher = launcher.unwrap_or_else(|| Arc::new(SystemProcessLauncher));
        Self {
            config: Arc::new(config),
            catalog,
            resolver,
            launcher,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            create_lock: tokio::sync::Mutex::new(()),
            cleanup_done: AtomicBool::new(false),
        }
    }

    /// Must complete before any `create_stream` call is accepted; kills and
    /// clears whatever a previous run left under the session root.
    pub async fn first_run_cleanup(&self) -> RecoveryReport {
        let report = recovery::first_run_cleanup(
            &self.config.session_root(),
            &self.config.pipeline.manifest_name,
        )
        .await;
        self.cleanup_done.store(true, Ordering::SeqCst);
        report
    }

    /// Look up or create the session for a channel. An existing live
    /// session is shared: its keep-alive is refreshed, the viewer count
    /// goes up, and no new pipeline is started.
    pub async fn create_stream(&self, channel_name: &str) -> OrchestratorResult<StreamHandle> {
        if !self.cleanup_done.load(Ordering::SeqCst) {
            return Err(OrchestratorError::CleanupPending);
        }
        if let Some(handle) = self.try_join(channel_name)? {
            return Ok(handle);
        }

        let _guard = self.create_lock.lock().await;
        // Re-check under the creation lock; a concurrent request for the
        // same name may have won the race.
        if let Some(handle) = self.try_join(channel_name)? {
            return Ok(handle);
        }
        self.check_admission()?;

        let session = Session::open(
            channel_name,
            Arc::clone(&self.config),
            self.catalog.as_ref(),
            self.resolver.as_ref(),
            self.launcher.as_ref(),
            Arc::downgrade(&self.sessions),
        )
        .await?;

        let handle = StreamHandle {
            channel_name: channel_name.to_string(),
            playlist_path: session.playlist_path().to_path_buf(),
        };
        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(channel_name.to_string(), Arc::clone(&session));
        }
        // A pipeline can die between open returning and the insert above;
        // its teardown ran before the map held it, so re-arm the release.
        if session.is_killed() {
            session.schedule_release();
        }
        info!(
            channel = channel_name,
            active = self.active_count(),
            "stream session registered"
        );
        Ok(handle)
    }

    /// Viewer keep-alive. Returns false when no live session exists; never
    /// creates one.
    pub fn ping(&self, channel_name: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(channel_name) {
            Some(session) if !session.is_killed() => {
                session.touch();
                true
            }
            _ => false,
        }
    }

    /// Viewer-initiated stop; a no-op when no session exists. The session
    /// is torn down once its last viewer leaves.
    pub async fn stop(&self, channel_name: &str) {
        let session = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(channel_name).cloned()
        };
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Subscribe to the status/log/killed event stream of a channel.
    pub fn subscribe(&self, channel_name: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(channel_name).map(|session| session.subscribe())
    }

    pub fn session(&self, channel_name: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(channel_name).cloned()
    }

    /// Sessions currently holding a tuner, draining ones included.
    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn try_join(&self, channel_name: &str) -> OrchestratorResult<Option<StreamHandle>> {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(channel_name) {
            Some(session) if session.is_killed() => Err(OrchestratorError::TunerReleasing(
                channel_name.to_string(),
            )),
            Some(session) => {
                session.touch();
                session.join();
                Ok(Some(StreamHandle {
                    channel_name: channel_name.to_string(),
                    playlist_path: session.playlist_path().to_path_buf(),
                }))
            }
            None => Ok(None),
        }
    }

    fn check_admission(&self) -> OrchestratorResult<()> {
        let max_streams = self.config.limits.max_streams;
        if max_streams == 0 {
            return Ok(());
        }
        let active_streams = self.active_count();
        if active_streams >= max_streams {
            return Err(OrchestratorError::AdmissionRejected {
                max_streams,
                active_streams,
            });
        }
        Ok(())
    }
}
