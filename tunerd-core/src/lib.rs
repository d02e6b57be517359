pub mod catalog;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod resolver;

pub use catalog::{ranking::RankingRules, ChannelCatalog, ChannelRecord, InMemoryCatalog};
pub use config::{load_tunerd_config, TunerdConfig};
pub use error::{ConfigError, Result};
pub use orchestrator::{
    first_run_cleanup, pid_alive, sanitize_channel_name, KillReason, OrchestratorError,
    ProcessLauncher, RecoveryReport, Session, SessionEvent, SessionStatus, StreamHandle,
    StreamOrchestrator, SystemProcessLauncher,
};
pub use resolver::{HttpUrlResolver, PassthroughResolver, StreamUrlResolver};
