mod common;

use std::sync::Arc;

use tempfile::TempDir;
use tunerd_core::{ChannelRecord, OrchestratorError};

use common::{build_orchestrator, spawned_urls, test_config};

fn demo_record(id: &str, url: &str) -> ChannelRecord {
    ChannelRecord::new(id, "Demo", url)
}

#[tokio::test]
async fn concurrent_requests_share_one_pipeline() {
    let base = TempDir::new().unwrap();
    let config = test_config(base.path());
    let orchestrator = Arc::new(build_orchestrator(
        config,
        vec![demo_record("src-1", "ok-demo")],
    ));
    orchestrator.first_run_cleanup().await;

    let mut joins = Vec::new();
    for _ in 0..8 {
        let orchestrator = Arc::clone(&orchestrator);
        joins.push(tokio::spawn(async move {
            orchestrator.create_stream("Demo").await
        }));
    }
    let mut playlist_paths = Vec::new();
    for join in joins {
        let handle = join.await.unwrap().unwrap();
        playlist_paths.push(handle.playlist_path);
    }

    assert!(playlist_paths.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(spawned_urls(base.path()), vec!["ok-demo".to_string()]);
    assert_eq!(orchestrator.active_count(), 1);
    let session = orchestrator.session("Demo").unwrap();
    assert_eq!(session.viewer_count(), 8);
}

#[tokio::test]
async fn admission_rejects_beyond_limit() {
    let base = TempDir::new().unwrap();
    let mut config = test_config(base.path());
    config.limits.max_streams = 1;
    let orchestrator = build_orchestrator(
        config,
        vec![
            ChannelRecord::new("a", "Alpha", "ok-alpha"),
            ChannelRecord::new("b", "Beta", "ok-beta"),
        ],
    );
    orchestrator.first_run_cleanup().await;

    orchestrator.create_stream("Alpha").await.unwrap();
    let rejected = orchestrator.create_stream("Beta").await.unwrap_err();
    match rejected {
        OrchestratorError::AdmissionRejected {
            max_streams,
            active_streams,
        } => {
            assert_eq!(max_streams, 1);
            assert_eq!(active_streams, 1);
        }
        other => panic!("expected admission rejection, got {other}"),
    }
    // The shared-session path is unaffected by the ceiling.
    orchestrator.create_stream("Alpha").await.unwrap();
}

#[tokio::test]
async fn zero_limit_means_unlimited() {
    let base = TempDir::new().unwrap();
    let config = test_config(base.path());
    assert_eq!(config.limits.max_streams, 0);
    let orchestrator = build_orchestrator(
        config,
        vec![
            ChannelRecord::new("a", "Alpha", "ok-alpha"),
            ChannelRecord::new("b", "Beta", "ok-beta"),
            ChannelRecord::new("c", "Gamma", "ok-gamma"),
        ],
    );
    orchestrator.first_run_cleanup().await;

    orchestrator.create_stream("Alpha").await.unwrap();
    orchestrator.create_stream("Beta").await.unwrap();
    orchestrator.create_stream("Gamma").await.unwrap();
    assert_eq!(orchestrator.active_count(), 3);
}

#[tokio::test]
async fn requests_are_gated_until_cleanup_runs() {
    let base = TempDir::new().unwrap();
    let config = test_config(base.path());
    let orchestrator = build_orchestrator(config, vec![demo_record("src-1", "ok-demo")]);

    let error = orchestrator.create_stream("Demo").await.unwrap_err();
    assert!(matches!(error, OrchestratorError::CleanupPending));

    orchestrator.first_run_cleanup().await;
    orchestrator.create_stream("Demo").await.unwrap();
}

#[tokio::test]
async fn unknown_channel_fails_without_registering() {
    let base = TempDir::new().unwrap();
    let config = test_config(base.path());
    let orchestrator = build_orchestrator(config, vec![]);
    orchestrator.first_run_cleanup().await;

    let error = orchestrator.create_stream("Nowhere").await.unwrap_err();
    assert!(matches!(error, OrchestratorError::NoSources(_)));
    assert_eq!(orchestrator.active_count(), 0);
}
