//! Video library discovery, encode scheduling, and HLS artifact lookup.
//!
//! Source files live at the top of the media root; ready streams live under
//! `<root>/processed/<name>/` and qualify once a readable `master.m3u8`
//! exists there. Each source is encoded at most once concurrently: the
//! in-flight set is the deduplication primitive.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::logging::Stats;
use crate::service::encoder::{Encoder, MASTER_PLAYLIST};
use crate::validation::{sanitize_output_name, validate_stream_name, validate_subpath};
use crate::{Error, Result};

/// Source extensions admitted by the scanner (case-insensitive)
pub const SOURCE_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "wmv"];

/// Subdirectory of the media root holding encoded output
pub const PROCESSED_DIR: &str = "processed";

/// A ready HLS stream derived from disk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Wire identifier, `hls:<name>`
    pub stream_id: String,
    pub master_playlist: PathBuf,
}

pub struct VideoCatalog {
    root: PathBuf,
    processed: PathBuf,
    encoder: Arc<dyn Encoder>,
    /// Sanitized output names with an encode currently running
    in_flight: Mutex<HashSet<String>>,
    list_cache: RwLock<Option<Vec<StreamEntry>>>,
    stats: Arc<Stats>,
}

impl std::fmt::Debug for VideoCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoCatalog").field("root", &self.root).finish()
    }
}

impl VideoCatalog {
    pub async fn new(root: impl Into<PathBuf>, encoder: Arc<dyn Encoder>, stats: Arc<Stats>) -> Result<Self> {
        let root = root.into();
        let processed = root.join(PROCESSED_DIR);
        tokio::fs::create_dir_all(&processed).await?;
        Ok(Self {
            root,
            processed,
            encoder,
            in_flight: Mutex::new(HashSet::new()),
            list_cache: RwLock::new(None),
            stats,
        })
    }

    /// Ready streams, ordered by name. Cached until the next successful
    /// encode (or explicit invalidation).
    pub async fn list(&self) -> Result<Vec<StreamEntry>> {
        if let Some(cached) = self.list_cache.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let entries = self.scan_processed().await?;
        *self.list_cache.write().await = Some(entries.clone());
        Ok(entries)
    }

    pub async fn invalidate_cache(&self) {
        *self.list_cache.write().await = None;
    }

    async fn scan_processed(&self) -> Result<Vec<StreamEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.processed).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let Ok(name) = item.file_name().into_string() else {
                continue;
            };
            if validate_stream_name(&name).is_err() {
                continue;
            }
            let master = item.path().join(MASTER_PLAYLIST);
            match tokio::fs::metadata(&master).await {
                Ok(meta) if meta.is_file() => entries.push(StreamEntry {
                    stream_id: format!("hls:{name}"),
                    master_playlist: master,
                }),
                _ => {}
            }
        }
        entries.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        Ok(entries)
    }

    /// Resolve an HLS artifact request to an absolute path and content type.
    ///
    /// Both the stream name and each subpath component are allowlist-checked
    /// before touching the filesystem, and the canonicalized result must
    /// still be under `<root>/processed/`.
    pub async fn resolve(&self, stream_name: &str, subpath: &str) -> Result<(PathBuf, &'static str)> {
        validate_stream_name(stream_name)?;
        validate_subpath(subpath)?;

        let mut path = self.processed.join(stream_name);
        for component in subpath.split('/') {
            path.push(component);
        }

        let canonical = tokio::fs::canonicalize(&path)
            .await
            .map_err(|_| Error::NotFound(format!("{stream_name}/{subpath}")))?;
        let canonical_root = tokio::fs::canonicalize(&self.processed).await?;
        if !canonical.starts_with(&canonical_root) {
            return Err(Error::PathEscape(format!("{stream_name}/{subpath}")));
        }

        Ok((canonical, content_type_for(subpath)))
    }

    /// Scan the library root and start an encode for every unprocessed
    /// source. Encodes run on their own tasks; the scan itself only reads
    /// one directory level.
    pub async fn scan_and_encode(self: &Arc<Self>) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            let path = item.path();
            if !has_source_extension(&path) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let output_name = sanitize_output_name(stem);
            if output_name.is_empty() {
                continue;
            }

            let output_dir = self.processed.join(&output_name);
            if tokio::fs::metadata(output_dir.join(MASTER_PLAYLIST))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                continue;
            }

            // check-and-mark under one lock so two scans cannot both admit
            // the same source
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if !in_flight.insert(output_name.clone()) {
                    debug!(source = %path.display(), "encode already in flight, skipping");
                    continue;
                }
            }

            self.start_encode(path, output_name, output_dir);
        }
        Ok(())
    }

    fn start_encode(self: &Arc<Self>, source: PathBuf, output_name: String, output_dir: PathBuf) {
        let catalog = Arc::clone(self);
        Stats::incr(&catalog.stats.encodes_started);
        info!(source = %source.display(), stream = %output_name, "encode starting");

        tokio::spawn(async move {
            let result = catalog.encoder.encode(&source, &output_dir).await;
            match &result {
                Ok(()) => {
                    catalog.invalidate_cache().await;
                    info!(stream = %output_name, "stream ready");
                }
                Err(e) => {
                    Stats::incr(&catalog.stats.encodes_failed);
                    warn!(source = %source.display(), error = %e, "encode failed");
                }
            }
            // success or failure, the source becomes eligible for future scans
            catalog.in_flight.lock().unwrap().remove(&output_name);
        });
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Cooperative background scan loop. The first scan runs immediately.
    pub fn spawn_scanner(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.scan_and_encode().await {
                    warn!(error = %e, "library scan failed");
                }
            }
        })
    }
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_lowercase();
            SOURCE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

fn content_type_for(subpath: &str) -> &'static str {
    if subpath.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if subpath.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_extension_filter() {
        assert!(has_source_extension(Path::new("a.mp4")));
        assert!(has_source_extension(Path::new("a.MKV")));
        assert!(has_source_extension(Path::new("dir/movie.mov")));
        assert!(!has_source_extension(Path::new("a.m3u8")));
        assert!(!has_source_extension(Path::new("a.txt")));
        assert!(!has_source_extension(Path::new("noext")));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("master.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("720p/seg_0001.ts"), "video/mp2t");
        assert_eq!(content_type_for("poster.jpg"), "application/octet-stream");
    }
}
