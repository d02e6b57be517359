use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tunerd_core::config::{
    LimitsSection, PathsSection, PipelineSection, SystemSection, TunerdConfig,
};
use tunerd_core::resolver::PassthroughResolver;
use tunerd_core::{ChannelRecord, InMemoryCatalog, StreamOrchestrator};

/// Fake pipeline used instead of streamlink/ffmpeg. The capture script
/// appends its url argument to `spawns.log` and stays alive unless the url
/// contains "fail"; the encode script writes a manifest plus one segment
/// and then drains stdin until the capture side goes away.
pub fn write_pipeline_scripts(base: &Path) -> (String, String) {
    let spawn_log = base.join("spawns.log");
    let capture = base.join("capture.sh");
    std::fs::write(
        &capture,
        format!(
            "#!/bin/sh\n\
             echo \"$1\" >> \"{}\"\n\
             case \"$1\" in *fail*) exit 1 ;; esac\n\
             exec sleep 30\n",
            spawn_log.display()
        ),
    )
    .unwrap();
    let encode = base.join("encode.sh");
    std::fs::write(
        &encode,
        "#!/bin/sh\n\
         touch \"$1\"\n\
         touch \"$(dirname \"$1\")/segment_00001.ts\"\n\
         exec cat > /dev/null\n",
    )
    .unwrap();
    for path in [&capture, &encode] {
        let mut permissions = std::fs::metadata(path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(path, permissions).unwrap();
    }
    (
        capture.to_string_lossy().to_string(),
        encode.to_string_lossy().to_string(),
    )
}

pub fn test_config(base: &Path) -> TunerdConfig {
    let (capture_bin, encode_bin) = write_pipeline_scripts(base);
    TunerdConfig {
        system: SystemSection {
            node_name: "tunerd-test".to_string(),
            environment: "test".to_string(),
        },
        paths: PathsSection {
            base_dir: base.to_string_lossy().to_string(),
            session_root: "sessions".to_string(),
            logs_dir: "logs".to_string(),
        },
        limits: LimitsSection {
            max_streams: 0,
            inactivity_timeout_secs: 60,
            grace_window_ms: 200,
            tuner_release_delay_ms: 200,
            min_ready_segments: 1,
            startup_estimate_secs: 10,
        },
        pipeline: PipelineSection {
            capture_bin,
            capture_args: vec!["{url}".to_string()],
            encode_bin,
            encode_args: vec!["{playlist}".to_string()],
            quality_preferences: vec!["best".to_string()],
            manifest_name: "playlist.m3u8".to_string(),
            segment_ext: "ts".to_string(),
        },
    }
}

pub fn build_orchestrator(
    config: TunerdConfig,
    records: Vec<ChannelRecord>,
) -> StreamOrchestrator {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.replace_all(records);
    StreamOrchestrator::new(config, catalog, Arc::new(PassthroughResolver), None)
}

/// Urls handed to the capture script, in spawn order.
pub fn spawned_urls(base: &Path) -> Vec<String> {
    std::fs::read_to_string(base.join("spawns.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn session_dir(base: &Path, sanitized_name: &str) -> PathBuf {
    base.join("sessions").join(sanitized_name)
}
