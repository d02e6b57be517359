use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TunerdConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub pipeline: PipelineSection,
}

impl TunerdConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn session_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.session_root)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.inactivity_timeout_secs)
    }

    /// Supervisor tick interval, a fraction of the inactivity timeout so an
    /// idle session is reclaimed within one tick of expiring.
    pub fn supervisor_interval(&self) -> Duration {
        self.inactivity_timeout() / 5
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.limits.grace_window_ms)
    }

    pub fn tuner_release_delay(&self) -> Duration {
        Duration::from_millis(self.limits.tuner_release_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    /// Root under which every session gets its own output directory.
    pub session_root: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    /// Maximum simultaneous tuners; 0 means unlimited.
    pub max_streams: usize,
    pub inactivity_timeout_secs: u64,
    pub grace_window_ms: u64,
    /// Delay before a torn-down session's name may be reused, giving the
    /// upstream source time to relinquish the connection.
    pub tuner_release_delay_ms: u64,
    /// Segment count at which a session is reported ready.
    pub min_ready_segments: usize,
    /// Expected seconds until first segments appear, used for the
    /// time-based progress estimate before the session is ready.
    pub startup_estimate_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    pub capture_bin: String,
    /// Capture arguments; `{url}` and `{quality}` are substituted.
    pub capture_args: Vec<String>,
    pub encode_bin: String,
    /// Encode arguments; `{playlist}` and `{segments}` are substituted.
    pub encode_args: Vec<String>,
    /// Ordered quality fallback list handed to the capture program.
    pub quality_preferences: Vec<String>,
    pub manifest_name: String,
    pub segment_ext: String,
}

impl PipelineSection {
    pub fn quality_selector(&self) -> String {
        self.quality_preferences.join(",")
    }
}

pub fn load_tunerd_config<P: AsRef<Path>>(path: P) -> Result<TunerdConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
