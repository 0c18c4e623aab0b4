//! Encoder contract and the ffmpeg implementation.
//!
//! The catalog treats the encoder as a black box: given a source file and an
//! output directory, it must leave behind rendition subdirectories and a
//! readable `master.m3u8` on success. Encoding runs for minutes and must
//! never be invoked from a request path.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result};

/// Name of the top-level playlist that marks a stream as ready
pub const MASTER_PLAYLIST: &str = "master.m3u8";

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Transcode `source` into an HLS stream under `output_dir`, writing
    /// `master.m3u8` last.
    async fn encode(&self, source: &Path, output_dir: &Path) -> Result<()>;
}

/// One rung of the adaptive-bitrate ladder
struct Rendition {
    name: &'static str,
    height: u32,
    video_bitrate: &'static str,
    max_bitrate: &'static str,
    buf_size: &'static str,
    audio_bitrate: &'static str,
    /// Peak bandwidth advertised in the master playlist, bits/s
    bandwidth: u64,
    resolution: &'static str,
}

const RENDITIONS: &[Rendition] = &[
    Rendition {
        name: "1080p",
        height: 1080,
        video_bitrate: "5000k",
        max_bitrate: "5350k",
        buf_size: "10700k",
        audio_bitrate: "192k",
        bandwidth: 5_500_000,
        resolution: "1920x1080",
    },
    Rendition {
        name: "720p",
        height: 720,
        video_bitrate: "2800k",
        max_bitrate: "2996k",
        buf_size: "5992k",
        audio_bitrate: "128k",
        bandwidth: 3_100_000,
        resolution: "1280x720",
    },
    Rendition {
        name: "480p",
        height: 480,
        video_bitrate: "1400k",
        max_bitrate: "1498k",
        buf_size: "2996k",
        audio_bitrate: "96k",
        bandwidth: 1_600_000,
        resolution: "854x480",
    },
];

/// HLS segment duration in seconds
const SEGMENT_SECONDS: u32 = 6;

/// Transcodes with an external ffmpeg binary, one pass per rendition.
pub struct FfmpegEncoder {
    bin: String,
}

impl FfmpegEncoder {
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn build_rendition_command(&self, source: &Path, dir: &Path, r: &Rendition) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error").arg("-y");
        cmd.arg("-i").arg(source);
        cmd.arg("-vf").arg(format!("scale=-2:{}", r.height));
        cmd.arg("-c:v").arg("libx264");
        cmd.arg("-preset").arg("veryfast");
        cmd.arg("-b:v").arg(r.video_bitrate);
        cmd.arg("-maxrate").arg(r.max_bitrate);
        cmd.arg("-bufsize").arg(r.buf_size);
        cmd.arg("-c:a").arg("aac");
        cmd.arg("-b:a").arg(r.audio_bitrate);
        cmd.arg("-hls_time").arg(SEGMENT_SECONDS.to_string());
        cmd.arg("-hls_playlist_type").arg("vod");
        cmd.arg("-hls_segment_filename").arg(dir.join("seg_%04d.ts"));
        cmd.arg(dir.join("playlist.m3u8"));
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
        cmd
    }

    fn master_playlist() -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        for r in RENDITIONS {
            out.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n{}/playlist.m3u8\n",
                r.bandwidth, r.resolution, r.name
            ));
        }
        out
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, source: &Path, output_dir: &Path) -> Result<()> {
        for r in RENDITIONS {
            let dir = output_dir.join(r.name);
            tokio::fs::create_dir_all(&dir).await?;

            debug!(source = %source.display(), rendition = r.name, "rendition pass starting");
            let output = self
                .build_rendition_command(source, &dir, r)
                .output()
                .await
                .map_err(|e| Error::Encoder(format!("failed to spawn {}: {e}", self.bin)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Encoder(format!(
                    "{} exited with {} for rendition {}: {}",
                    self.bin,
                    output.status,
                    r.name,
                    stderr.trim()
                )));
            }
        }

        // the master playlist is written last so its presence means "complete"
        tokio::fs::write(output_dir.join(MASTER_PLAYLIST), Self::master_playlist()).await?;
        info!(source = %source.display(), output = %output_dir.display(), "encode complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_playlist_references_every_rendition() {
        let playlist = FfmpegEncoder::master_playlist();
        assert!(playlist.starts_with("#EXTM3U"));
        for r in RENDITIONS {
            assert!(playlist.contains(&format!("{}/playlist.m3u8", r.name)));
            assert!(playlist.contains(&format!("BANDWIDTH={}", r.bandwidth)));
        }
    }

    #[test]
    fn test_rendition_command_shape() {
        let encoder = FfmpegEncoder::new("ffmpeg");
        let cmd = encoder.build_rendition_command(
            Path::new("/in/movie.mp4"),
            Path::new("/out/movie/720p"),
            &RENDITIONS[1],
        );
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/in/movie.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1] == "scale=-2:720"));
        assert!(args.windows(2).any(|w| w[0] == "-hls_time" && w[1] == "6"));
        assert!(args.last().unwrap().ends_with("playlist.m3u8"));
    }
}
