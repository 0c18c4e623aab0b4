//! Integration tests for cinesync-core services
//!
//! These tests verify end-to-end behavior across service layers: session
//! auth round-trips, catalog scanning with a stub encoder, and path
//! confinement on the serving side.
//!
//! Run with: cargo test --test integration_tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use cinesync_core::logging::Stats;
use cinesync_core::models::Role;
use cinesync_core::service::encoder::MASTER_PLAYLIST;
use cinesync_core::service::{AuthStore, Encoder, VideoCatalog};
use cinesync_core::Error;

/// Test encoder: optionally blocks until released, then either writes a
/// master playlist or fails.
struct StubEncoder {
    started: AtomicUsize,
    gate: Option<Arc<Notify>>,
    fail: bool,
}

impl StubEncoder {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self { started: AtomicUsize::new(0), gate: None, fail: false })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self { started: AtomicUsize::new(0), gate: None, fail: true })
    }

    fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self { started: AtomicUsize::new(0), gate: Some(gate), fail: false })
    }
}

#[async_trait]
impl Encoder for StubEncoder {
    async fn encode(&self, _source: &Path, output_dir: &Path) -> cinesync_core::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(Error::Encoder("stub failure".to_string()));
        }
        tokio::fs::create_dir_all(output_dir).await?;
        tokio::fs::write(output_dir.join(MASTER_PLAYLIST), "#EXTM3U\n").await?;
        Ok(())
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}

// ---- session auth ----

#[test]
fn test_password_then_token_auth_preserves_role() {
    let auth = AuthStore::new("admin-pw".to_string(), "viewer-pw".to_string(), 60_000);

    let role = auth.validate_password("admin-pw").expect("operator password accepted");
    assert_eq!(role, Role::Operator);
    let token = auth.create_session(role, "Ada");

    // reconnecting with only the token yields the same role and name
    for _ in 0..3 {
        let session = auth.validate_session(&token).expect("token accepted within TTL");
        assert_eq!(session.role, Role::Operator);
        assert_eq!(session.name, "Ada");
    }
}

#[test]
fn test_token_rejected_once_ttl_elapses() {
    let auth = AuthStore::new("admin-pw".to_string(), "viewer-pw".to_string(), 0);
    let token = auth.create_session(Role::Viewer, "v");
    assert!(auth.validate_session(&token).is_none());
}

// ---- catalog scanning and encoding ----

#[tokio::test]
async fn test_scan_encodes_new_source_and_refreshes_list() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("My Movie (2024).mp4"), b"x").await.unwrap();
    tokio::fs::write(dir.path().join("notes.txt"), b"x").await.unwrap();

    let encoder = StubEncoder::succeeding();
    let catalog =
        Arc::new(VideoCatalog::new(dir.path(), encoder.clone(), Stats::new()).await.unwrap());

    assert!(catalog.list().await.unwrap().is_empty());

    catalog.scan_and_encode().await.unwrap();
    wait_until(|| catalog.in_flight_count() == 0).await;

    assert_eq!(encoder.started.load(Ordering::SeqCst), 1);
    let streams = catalog.list().await.unwrap();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].stream_id, "hls:My_Movie__2024_");

    // a second scan finds the master playlist and does nothing
    catalog.scan_and_encode().await.unwrap();
    wait_until(|| catalog.in_flight_count() == 0).await;
    assert_eq!(encoder.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_scans_encode_each_source_once() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("movie.mkv"), b"x").await.unwrap();

    let gate = Arc::new(Notify::new());
    let encoder = StubEncoder::gated(gate.clone());
    let catalog =
        Arc::new(VideoCatalog::new(dir.path(), encoder.clone(), Stats::new()).await.unwrap());

    catalog.scan_and_encode().await.unwrap();
    wait_until(|| encoder.started.load(Ordering::SeqCst) == 1).await;

    // the encode is in flight: further scans must not double-enqueue
    catalog.scan_and_encode().await.unwrap();
    catalog.scan_and_encode().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(encoder.started.load(Ordering::SeqCst), 1);

    gate.notify_one();
    wait_until(|| catalog.in_flight_count() == 0).await;
    assert_eq!(catalog.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_encode_clears_in_flight_and_is_retried_next_scan() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("movie.mov"), b"x").await.unwrap();

    let stats = Stats::new();
    let encoder = StubEncoder::failing();
    let catalog =
        Arc::new(VideoCatalog::new(dir.path(), encoder.clone(), stats.clone()).await.unwrap());

    catalog.scan_and_encode().await.unwrap();
    wait_until(|| catalog.in_flight_count() == 0).await;
    assert!(catalog.list().await.unwrap().is_empty());
    assert_eq!(stats.encodes_failed.load(Ordering::Relaxed), 1);

    // no automatic retry, but the next scan re-attempts
    catalog.scan_and_encode().await.unwrap();
    wait_until(|| catalog.in_flight_count() == 0).await;
    assert_eq!(encoder.started.load(Ordering::SeqCst), 2);
}

// ---- serving confinement ----

async fn catalog_with_stream(dir: &Path) -> Arc<VideoCatalog> {
    let stream = dir.join("processed").join("intro");
    tokio::fs::create_dir_all(stream.join("720p")).await.unwrap();
    tokio::fs::write(stream.join(MASTER_PLAYLIST), "#EXTM3U\n").await.unwrap();
    tokio::fs::write(stream.join("720p").join("seg_0001.ts"), b"seg").await.unwrap();
    Arc::new(VideoCatalog::new(dir, StubEncoder::succeeding(), Stats::new()).await.unwrap())
}

#[tokio::test]
async fn test_resolve_serves_hls_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog_with_stream(dir.path()).await;

    let (path, content_type) = catalog.resolve("intro", "master.m3u8").await.unwrap();
    assert!(path.ends_with("intro/master.m3u8"));
    assert_eq!(content_type, "application/vnd.apple.mpegurl");

    let (path, content_type) = catalog.resolve("intro", "720p/seg_0001.ts").await.unwrap();
    assert!(path.ends_with("720p/seg_0001.ts"));
    assert_eq!(content_type, "video/mp2t");
}

#[tokio::test]
async fn test_resolve_rejects_traversal_and_bad_names() {
    let dir = tempfile::tempdir().unwrap();
    // a file outside processed/ that must never be reachable
    tokio::fs::write(dir.path().join("server-config.txt"), b"secret").await.unwrap();
    let catalog = catalog_with_stream(dir.path()).await;

    assert!(matches!(
        catalog.resolve("intro", "../../server-config.txt").await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(catalog.resolve("../etc", "master.m3u8").await, Err(Error::InvalidInput(_))));
    assert!(matches!(catalog.resolve("intro", "/etc/passwd").await, Err(Error::InvalidInput(_))));
    assert!(matches!(catalog.resolve("intro", "missing.ts").await, Err(Error::NotFound(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn test_resolve_rejects_symlink_escape() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("secret.txt"), b"secret").await.unwrap();
    let catalog = catalog_with_stream(dir.path()).await;

    // a well-formed subpath whose target resolves outside processed/
    std::os::unix::fs::symlink(
        dir.path().join("secret.txt"),
        dir.path().join("processed").join("intro").join("leak.ts"),
    )
    .unwrap();

    assert!(matches!(
        catalog.resolve("intro", "leak.ts").await,
        Err(Error::PathEscape(_))
    ));
}
