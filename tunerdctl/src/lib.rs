use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tunerd_core::catalog::ranking::{rank, RankingRules};
use tunerd_core::orchestrator::recovery::first_run_cleanup;
use tunerd_core::{load_tunerd_config, pid_alive, ChannelRecord, RecoveryReport, TunerdConfig};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] tunerd_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "tunerd command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main tunerd.toml
    #[arg(long, default_value = "configs/tunerd.toml")]
    pub config: PathBuf,
    /// Override for the session root directory
    #[arg(long)]
    pub session_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect the session directories under the session root
    Status,
    /// Kill leftover pipeline processes and clear stale session directories
    Cleanup,
    /// Score and order the sources of a catalog export
    Rank(RankArgs),
    /// Validate configuration and referenced paths
    Health,
}

#[derive(Args, Debug)]
pub struct RankArgs {
    /// JSON file containing an array of channel records
    #[arg(long)]
    pub catalog: PathBuf,
    /// Restrict output to one channel name
    #[arg(long)]
    pub channel: Option<String>,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let sessions = context.session_status()?;
            render(&sessions, cli.format)?;
        }
        Commands::Cleanup => {
            let report = block_on(first_run_cleanup(
                &context.session_root,
                &context.config.pipeline.manifest_name,
            ))?;
            render(&report, cli.format)?;
        }
        Commands::Rank(args) => {
            let ranked = context.rank_catalog(args)?;
            render(&ranked, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: TunerdConfig,
    config_path: PathBuf,
    session_root: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_tunerd_config(&cli.config)?;
        let session_root = cli
            .session_root
            .clone()
            .unwrap_or_else(|| config.session_root());
        Ok(Self {
            config,
            config_path: cli.config.clone(),
            session_root,
        })
    }

    fn session_status(&self) -> Result<SessionList> {
        let mut rows = Vec::new();
        let entries = match fs::read_dir(&self.session_root) {
            Ok(entries) => entries,
            Err(_) => return Ok(SessionList { rows }),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            rows.push(self.inspect_session_dir(&dir));
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(SessionList { rows })
    }

    fn inspect_session_dir(&self, dir: &Path) -> SessionEntry {
        let pipeline = &self.config.pipeline;
        let segment_suffix = format!(".{}", pipeline.segment_ext);
        let mut manifest_exists = false;
        let mut segment_count = 0;
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name == pipeline.manifest_name {
                    manifest_exists = true;
                } else if name.ends_with(&segment_suffix) {
                    segment_count += 1;
                }
            }
        }
        let marker = dir.join(format!("{}.pid", pipeline.manifest_name));
        let pids = fs::read_to_string(&marker)
            .map(|contents| {
                contents
                    .lines()
                    .filter_map(|line| line.trim().parse::<u32>().ok())
                    .map(|pid| PidEntry {
                        pid,
                        alive: pid_alive(pid),
                    })
                    .collect()
            })
            .unwrap_or_default();
        SessionEntry {
            name: dir
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            manifest_exists,
            segment_count,
            pids,
        }
    }

    fn rank_catalog(&self, args: &RankArgs) -> Result<RankedList> {
        let raw = fs::read_to_string(&args.catalog)?;
        let mut records: Vec<ChannelRecord> = serde_json::from_str(&raw)?;
        if let Some(channel) = &args.channel {
            records.retain(|record| &record.name == channel);
        }
        let rules = RankingRules::new();
        for record in &mut records {
            record.rescore(&rules);
        }
        let rows = rank(records)
            .into_iter()
            .map(|record| RankedEntry {
                id: record.id,
                name: record.name,
                url: record.url,
                quality: record.quality,
                geo_blocked: record.geo_blocked,
                score: record.score,
            })
            .collect();
        Ok(RankedList { rows })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(check_path("tunerd.toml", &self.config_path));
        results.push(check_directory("session_root", &self.session_root));
        results.push(check_directory(
            "logs_dir",
            &self.config.resolve_path(&self.config.paths.logs_dir),
        ));
        results.push(check_program(
            "capture_bin",
            &self.config.pipeline.capture_bin,
        ));
        results.push(check_program(
            "encode_bin",
            &self.config.pipeline.encode_bin,
        ));
        results
    }
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{} missing", path.display()))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
        Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
    }
}

fn check_program(name: &str, program: &str) -> HealthEntry {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return check_path(name, path);
    }
    // Bare program names resolve through PATH at spawn time.
    let found = std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(program).exists())
        })
        .unwrap_or(false);
    if found {
        HealthEntry::ok(name, format!("{program} found in PATH"))
    } else {
        HealthEntry::warn(name, format!("{program} not found in PATH"))
    }
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub rows: Vec<SessionEntry>,
}

#[derive(Debug, Serialize)]
pub struct SessionEntry {
    pub name: String,
    pub manifest_exists: bool,
    pub segment_count: usize,
    pub pids: Vec<PidEntry>,
}

#[derive(Debug, Serialize)]
pub struct PidEntry {
    pub pid: u32,
    pub alive: bool,
}

#[derive(Debug, Serialize)]
pub struct RankedList {
    pub rows: Vec<RankedEntry>,
}

#[derive(Debug, Serialize)]
pub struct RankedEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    pub quality: Option<String>,
    pub geo_blocked: bool,
    pub score: i32,
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no session directories".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let pids = if entry.pids.is_empty() {
                "-".to_string()
            } else {
                entry
                    .pids
                    .iter()
                    .map(|p| format!("{}{}", p.pid, if p.alive { "*" } else { "" }))
                    .collect::<Vec<_>>()
                    .join(",")
            };
            lines.push(format!(
                "{} | manifest={} | segments={} | pids={}",
                entry.name, entry.manifest_exists, entry.segment_count, pids
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for RankedList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no matching records".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let quality = entry.quality.as_deref().unwrap_or("-");
            let geo = if entry.geo_blocked { " geo-blocked" } else { "" };
            lines.push(format!(
                "{:>4} | {} | {} | {}{}",
                entry.score, entry.name, entry.id, quality, geo
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for RecoveryReport {
    fn display(&self) -> String {
        format!(
            "scanned={} removed={} killed={:?} errors={}",
            self.scanned_dirs, self.removed_dirs, self.killed_pids, self.errors
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                format!(
                    "[{status}] {name}: {detail}",
                    status = entry.status,
                    name = entry.name,
                    detail = entry.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(root: &Path) -> PathBuf {
        let configs = root.join("configs");
        fs::create_dir_all(&configs).unwrap();
        let path = configs.join("tunerd.toml");
        let contents = format!(
            r#"
            [system]
            node_name = "ctl-test"
            environment = "test"

            [paths]
            base_dir = "{base}"
            session_root = "sessions"
            logs_dir = "logs"

            [limits]
            max_streams = 2
            inactivity_timeout_secs = 60
            grace_window_ms = 500
            tuner_release_delay_ms = 1000
            min_ready_segments = 2
            startup_estimate_secs = 10

            [pipeline]
            capture_bin = "streamlink"
            capture_args = ["--stdout", "{{url}}"]
            encode_bin = "ffmpeg"
            encode_args = ["-i", "pipe:0", "{{playlist}}"]
            quality_preferences = ["best"]
            manifest_name = "playlist.m3u8"
            segment_ext = "ts"
            "#,
            base = root.display()
        );
        fs::write(&path, contents).unwrap();
        path
    }

    fn context_for(root: &Path) -> AppContext {
        let cli = Cli {
            config: write_config(root),
            session_root: None,
            format: OutputFormat::Json,
            command: Commands::Status,
        };
        AppContext::new(&cli).unwrap()
    }

    #[test]
    fn status_inspects_session_directories() {
        let temp = TempDir::new().unwrap();
        let context = context_for(temp.path());

        let dir = temp.path().join("sessions").join("Demo");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("playlist.m3u8"), "#EXTM3U\n").unwrap();
        fs::write(dir.join("segment_00001.ts"), "x").unwrap();
        fs::write(dir.join("segment_00002.ts"), "x").unwrap();
        fs::write(dir.join("playlist.m3u8.pid"), "999999999\n").unwrap();

        let list = context.session_status().unwrap();
        assert_eq!(list.rows.len(), 1);
        let entry = &list.rows[0];
        assert_eq!(entry.name, "Demo");
        assert!(entry.manifest_exists);
        assert_eq!(entry.segment_count, 2);
        assert_eq!(entry.pids.len(), 1);
    }

    #[test]
    fn rank_orders_catalog_export() {
        let temp = TempDir::new().unwrap();
        let context = context_for(temp.path());

        let catalog_path = temp.path().join("catalog.json");
        fs::write(
            &catalog_path,
            r#"[
                {"id": "low", "name": "Demo", "url": "http://low", "quality": "480p"},
                {"id": "high", "name": "Demo", "url": "http://high", "quality": "1080p"},
                {"id": "other", "name": "Other", "url": "http://other", "quality": "4K"}
            ]"#,
        )
        .unwrap();

        let ranked = context
            .rank_catalog(&RankArgs {
                catalog: catalog_path,
                channel: Some("Demo".to_string()),
            })
            .unwrap();
        assert_eq!(ranked.rows.len(), 2);
        assert_eq!(ranked.rows[0].id, "high");
        assert_eq!(ranked.rows[1].id, "low");
    }

    #[test]
    fn health_reports_missing_session_root() {
        let temp = TempDir::new().unwrap();
        let context = context_for(temp.path());
        let report = context.health_check();
        let root_entry = report
            .iter()
            .find(|entry| entry.name == "session_root")
            .unwrap();
        assert!(matches!(root_entry.status, CheckStatus::Warn));
    }
}
