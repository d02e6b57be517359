use std::fmt;

use serde::Serialize;

/// Push events fanned out to the viewers of one channel. Delivery is
/// fire-and-forget over a broadcast channel; slow receivers may observe
/// gaps and consumers must tolerate duplicates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Status(SessionStatus),
    Log { lines: Vec<String> },
    Killed { channel_name: String, reason: String },
}

/// Snapshot of a session's output directory, published on every
/// supervisor tick.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub ready: bool,
    pub segment_count: usize,
    pub manifest_exists: bool,
    /// 0-100; pinned to 100 once enough segments and the manifest exist,
    /// a time-based estimate capped at 99 beforehand.
    pub progress_percent: u8,
    pub elapsed_seconds: u64,
    pub playlist_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillReason {
    Inactivity,
    Closed,
    ProcessExit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillReason::Inactivity => write!(f, "inactivity"),
            KillReason::Closed => write!(f, "closed by viewer"),
            KillReason::ProcessExit { code, signal } => {
                write!(
                    f,
                    "subprocess exit (code={code:?}, signal={signal:?})"
                )
            }
        }
    }
}
