//! Frame extraction utilities for uploaded video files
//!
//! Decoding is delegated to FFmpeg: `ffprobe` reports the display geometry of
//! the first video stream and `ffmpeg` streams every decoded frame to a pipe as
//! packed RGB24, in file order, pinned to that geometry.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error};

/// Bytes per pixel of the packed RGB24 stream
pub const RGB24_CHANNELS: usize = 3;

/// Largest frame accepted by default (4096x4096)
pub const DEFAULT_MAX_FRAME_PIXELS: u64 = 4096 * 4096;

/// Geometry of the decoded frames of a video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDimensions {
    pub width: u32,
    pub height: u32,
}

impl FrameDimensions {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Size in bytes of one RGB24 frame
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB24_CHANNELS
    }
}

#[derive(Debug, Deserialize)]
struct StreamListing {
    #[serde(default)]
    streams: Vec<StreamInfo>,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    side_data_list: Vec<SideData>,
    #[serde(default)]
    tags: Option<StreamTags>,
}

#[derive(Debug, Deserialize)]
struct SideData {
    rotation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StreamTags {
    rotate: Option<String>,
}

impl StreamInfo {
    /// Display rotation in degrees; the display matrix wins over the legacy tag
    fn rotation(&self) -> f64 {
        self.side_data_list
            .iter()
            .find_map(|side| side.rotation)
            .or_else(|| {
                self.tags
                    .as_ref()
                    .and_then(|tags| tags.rotate.as_deref())
                    .and_then(|rotate| rotate.trim().parse().ok())
            })
            .unwrap_or(0.0)
    }
}

/// Parse `ffprobe -of json -show_streams` output into the geometry ffmpeg
/// emits once it has applied the stream's display rotation.
///
/// Streams larger than `max_pixels` are rejected.
pub fn parse_stream_info(output: &str, max_pixels: u64) -> Result<FrameDimensions> {
    let listing: StreamListing =
        serde_json::from_str(output).context("unexpected ffprobe output format")?;
    let stream = listing
        .streams
        .first()
        .context("file has no video stream")?;

    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        anyhow::bail!("video stream has no geometry");
    };
    if width == 0 || height == 0 {
        anyhow::bail!("video stream has empty geometry {}x{}", width, height);
    }

    // Quarter turns swap the axes of the decoded frames
    let quarter_turn = (stream.rotation().round() as i64).rem_euclid(180) == 90;
    let dimensions = if quarter_turn {
        FrameDimensions {
            width: height,
            height: width,
        }
    } else {
        FrameDimensions { width, height }
    };

    if dimensions.pixels() > max_pixels {
        anyhow::bail!(
            "video frames of {}x{} exceed the limit of {} pixels",
            dimensions.width,
            dimensions.height,
            max_pixels
        );
    }

    Ok(dimensions)
}

/// Read the display dimensions of the first video stream of a file using ffprobe
pub async fn read_frame_dimensions(source: &Path, max_pixels: u64) -> Result<FrameDimensions> {
    debug!(source = %source.display(), "reading video dimensions");

    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v:0", "-show_streams", "-of", "json"])
        .arg(source)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to execute ffprobe")?;

    if !output.status.success() {
        anyhow::bail!(
            "ffprobe failed: {:?}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let output_str =
        String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
    let dimensions = parse_stream_info(&output_str, max_pixels)?;

    debug!(
        source = %source.display(),
        width = dimensions.width,
        height = dimensions.height,
        "read dimensions successfully"
    );

    Ok(dimensions)
}

/// Arguments that make ffmpeg decode the first video stream to raw RGB24 on stdout.
///
/// Every frame is scaled to `dimensions`, so resolution changes inside the
/// stream never alter the size of a frame on the pipe.
pub fn rgb24_stream_args(source: &Path, dimensions: FrameDimensions) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-nostdin".to_string(),
        "-i".to_string(),
        source.to_string_lossy().into_owned(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", dimensions.width, dimensions.height),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Spawn ffmpeg streaming decoded RGB24 frames of `source` to its stdout.
///
/// Stderr is piped for diagnostics. The child is killed when the returned
/// handle is dropped.
pub fn spawn_rgb24_stream(source: &Path, dimensions: FrameDimensions) -> Result<Child> {
    let args = rgb24_stream_args(source, dimensions);
    debug!(args = ?args, "spawning ffmpeg for frame streaming");

    Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            error!(source = %source.display(), error = %e, "failed to spawn ffmpeg");
            e
        })
        .context("failed to execute ffmpeg")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_info() {
        let output = r#"{"streams": [{"index": 0, "codec_type": "video", "width": 640, "height": 480}]}"#;
        let dims = parse_stream_info(output, DEFAULT_MAX_FRAME_PIXELS).unwrap();
        assert_eq!(dims, FrameDimensions { width: 640, height: 480 });
        assert_eq!(dims.frame_len(), 640 * 480 * 3);
    }

    #[test]
    fn test_parse_stream_info_applies_rotation() {
        let side_data = r#"{"streams": [{"width": 1920, "height": 1080,
            "side_data_list": [{"side_data_type": "Display Matrix", "rotation": -90}]}]}"#;
        let dims = parse_stream_info(side_data, DEFAULT_MAX_FRAME_PIXELS).unwrap();
        assert_eq!(dims, FrameDimensions { width: 1080, height: 1920 });

        let legacy_tag = r#"{"streams": [{"width": 1920, "height": 1080, "tags": {"rotate": "270"}}]}"#;
        let dims = parse_stream_info(legacy_tag, DEFAULT_MAX_FRAME_PIXELS).unwrap();
        assert_eq!(dims, FrameDimensions { width: 1080, height: 1920 });

        let upside_down = r#"{"streams": [{"width": 1920, "height": 1080, "tags": {"rotate": "180"}}]}"#;
        let dims = parse_stream_info(upside_down, DEFAULT_MAX_FRAME_PIXELS).unwrap();
        assert_eq!(dims, FrameDimensions { width: 1920, height: 1080 });
    }

    #[test]
    fn test_parse_stream_info_enforces_frame_limit() {
        let huge = r#"{"streams": [{"width": 30000, "height": 30000}]}"#;
        assert!(parse_stream_info(huge, DEFAULT_MAX_FRAME_PIXELS).is_err());

        let small = r#"{"streams": [{"width": 64, "height": 64}]}"#;
        assert!(parse_stream_info(small, 64 * 64).is_ok());
        assert!(parse_stream_info(small, 64 * 64 - 1).is_err());
    }

    #[test]
    fn test_parse_stream_info_rejects_garbage() {
        assert!(parse_stream_info("", DEFAULT_MAX_FRAME_PIXELS).is_err());
        assert!(parse_stream_info("640,480", DEFAULT_MAX_FRAME_PIXELS).is_err());
        assert!(parse_stream_info(r#"{"streams": []}"#, DEFAULT_MAX_FRAME_PIXELS).is_err());
        assert!(parse_stream_info(r#"{"streams": [{"codec_type": "video"}]}"#, DEFAULT_MAX_FRAME_PIXELS).is_err());
        assert!(parse_stream_info(r#"{"streams": [{"width": 0, "height": 480}]}"#, DEFAULT_MAX_FRAME_PIXELS).is_err());
    }

    #[test]
    fn test_rgb24_stream_args() {
        let dims = FrameDimensions { width: 1080, height: 1920 };
        let args = rgb24_stream_args(Path::new("uploads/clip.mp4"), dims);
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "uploads/clip.mp4");
        assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1] == "scale=1080:1920"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgb24"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[tokio::test]
    async fn test_missing_file_has_no_dimensions() {
        // Fails whether or not ffprobe is installed
        let result =
            read_frame_dimensions(Path::new("/nonexistent/clip.mp4"), DEFAULT_MAX_FRAME_PIXELS).await;
        assert!(result.is_err());
    }
}
