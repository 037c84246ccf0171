//! Uploaded video handling: staging on disk and sequential frame decoding.

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::frame_extractor::{self, FrameDimensions};
use image::RgbImage;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest sanitized client file name kept in a staged file name
const MAX_NAME_LEN: usize = 64;

/// Decoder diagnostics kept for the error report
const MAX_STDERR_BYTES: usize = 4096;

/// Sequential source of decoded RGB frames
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame in file order, or `None` at end of stream
    async fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Opens staged video files for decoding
#[async_trait]
pub trait VideoOpener: Send + Sync {
    /// Open `path`. An error means the container is unreadable.
    async fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}

/// Reads packed RGB24 frames of known geometry from a byte stream
pub struct RawFrameReader<R> {
    reader: R,
    dimensions: FrameDimensions,
    /// One frame worth of bytes, reused for every read
    buf: Vec<u8>,
    frames_read: u64,
}

impl<R> RawFrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, dimensions: FrameDimensions) -> Self {
        Self {
            reader,
            dimensions,
            buf: vec![0u8; dimensions.frame_len()],
            frames_read: 0,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Fill the frame buffer until it is full or the stream ends; returns the bytes read
    async fn fill(&mut self) -> io::Result<usize> {
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.reader.read(&mut self.buf[filled..]).await? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }
}

#[async_trait]
impl<R> FrameSource for RawFrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let filled = self.fill().await.context("failed to read decoded frame")?;

        if filled == 0 {
            return Ok(None);
        }
        if filled < self.buf.len() {
            warn!(
                frame = self.frames_read,
                expected = self.buf.len(),
                received = filled,
                "truncated frame at end of video stream"
            );
            return Ok(None);
        }

        self.frames_read += 1;
        let frame = RgbImage::from_raw(
            self.dimensions.width,
            self.dimensions.height,
            self.buf.clone(),
        )
        .context("frame buffer does not match video geometry")?;
        Ok(Some(frame))
    }
}

/// Live ffmpeg decode of one staged video.
///
/// The end of the frame stream is only accepted once ffmpeg has exited
/// successfully. Dropping the session kills the decoder process.
pub struct FfmpegVideoSession {
    child: Child,
    frames: RawFrameReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

impl FfmpegVideoSession {
    pub(crate) fn from_child(mut child: Child, dimensions: FrameDimensions) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .context("ffmpeg stdout was not captured")?;
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(stderr_tail(stderr)));

        Ok(Self {
            child,
            frames: RawFrameReader::new(stdout, dimensions),
            stderr,
            finished: false,
        })
    }

    async fn check_exit(&mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for ffmpeg")?;
        if status.success() {
            return Ok(());
        }

        let detail = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        anyhow::bail!(
            "ffmpeg exited with {} after {} frames: {}",
            status,
            self.frames.frames_read(),
            detail.trim()
        )
    }
}

#[async_trait]
impl FrameSource for FfmpegVideoSession {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.finished {
            return Ok(None);
        }
        match self.frames.next_frame().await? {
            Some(frame) => Ok(Some(frame)),
            None => {
                self.finished = true;
                self.check_exit().await?;
                Ok(None)
            }
        }
    }
}

/// Last `MAX_STDERR_BYTES` of the decoder's diagnostics
async fn stderr_tail(mut stderr: ChildStderr) -> String {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > MAX_STDERR_BYTES {
                    let excess = tail.len() - MAX_STDERR_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Opens videos with ffprobe/ffmpeg
#[derive(Debug, Clone, Copy)]
pub struct FfmpegVideoOpener {
    max_frame_pixels: u64,
}

impl FfmpegVideoOpener {
    /// Videos whose frames exceed `max_frame_pixels` are refused
    pub fn new(max_frame_pixels: u64) -> Self {
        Self { max_frame_pixels }
    }
}

impl Default for FfmpegVideoOpener {
    fn default() -> Self {
        Self::new(frame_extractor::DEFAULT_MAX_FRAME_PIXELS)
    }
}

#[async_trait]
impl VideoOpener for FfmpegVideoOpener {
    async fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let dimensions = frame_extractor::read_frame_dimensions(path, self.max_frame_pixels)
            .await
            .with_context(|| format!("cannot read video stream of {}", path.display()))?;

        let child = frame_extractor::spawn_rgb24_stream(path, dimensions)?;

        debug!(
            path = %path.display(),
            width = dimensions.width,
            height = dimensions.height,
            "opened video for decoding"
        );

        Ok(Box::new(FfmpegVideoSession::from_child(child, dimensions)?))
    }
}

/// An uploaded video written to the staging directory.
///
/// The file is removed when the value is dropped, whatever the outcome of the
/// request. Removal failures are logged and never surface to the caller.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
}

impl StagedUpload {
    /// Reserve a unique path under `dir` for an upload named `client_name`
    pub async fn create(dir: &Path, client_name: Option<&str>) -> Result<(Self, tokio::fs::File)> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create upload directory {}", dir.display()))?;

        let path = dir.join(staged_file_name(client_name));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to create staged upload {}", path.display()))?;

        Ok((Self { path }, file))
    }

    /// Stage `bytes` in one go
    pub async fn write(dir: &Path, client_name: Option<&str>, bytes: &[u8]) -> Result<Self> {
        let (staged, mut file) = Self::create(dir, client_name).await?;
        file.write_all(bytes).await.context("failed to write staged upload")?;
        file.flush().await.context("failed to flush staged upload")?;
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed staged upload"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove staged upload"
            ),
        }
    }
}

/// `<uuid>-<sanitized client name>`, never containing path separators
fn staged_file_name(client_name: Option<&str>) -> String {
    let sanitized: String = client_name
        .unwrap_or_default()
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .take(MAX_NAME_LEN)
        .collect();
    let sanitized = sanitized.trim_start_matches('.');

    if sanitized.is_empty() {
        format!("{}.video", Uuid::new_v4())
    } else {
        format!("{}-{}", Uuid::new_v4(), sanitized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn dims(width: u32, height: u32) -> FrameDimensions {
        FrameDimensions { width, height }
    }

    #[tokio::test]
    async fn test_raw_frames_are_read_in_order() {
        let mut bytes = vec![1u8; 2 * 2 * 3];
        bytes.extend(vec![2u8; 2 * 2 * 3]);
        let mut reader = RawFrameReader::new(Cursor::new(bytes), dims(2, 2));

        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(first.get_pixel(1, 1).0, [1, 1, 1]);
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(second.get_pixel(0, 0).0, [2, 2, 2]);
        assert!(reader.next_frame().await.unwrap().is_none());
        assert_eq!(reader.frames_read(), 2);
    }

    #[tokio::test]
    async fn test_truncated_frame_ends_stream() {
        let mut bytes = vec![7u8; 3];
        bytes.extend(vec![8u8; 2]);
        let mut reader = RawFrameReader::new(Cursor::new(bytes), dims(1, 1));

        assert!(reader.next_frame().await.unwrap().is_some());
        assert!(reader.next_frame().await.unwrap().is_none());
        assert_eq!(reader.frames_read(), 1);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let mut reader = RawFrameReader::new(Cursor::new(Vec::new()), dims(4, 4));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[test]
    fn test_staged_file_name_is_sanitized() {
        let name = staged_file_name(Some("../../etc/pass wd.mp4"));
        assert!(name.ends_with("-passwd.mp4"));
        assert!(!name.contains('/'));

        let hidden = staged_file_name(Some("..."));
        assert!(hidden.ends_with(".video"));

        let anonymous = staged_file_name(None);
        assert!(anonymous.ends_with(".video"));
        assert_ne!(staged_file_name(Some("a.mp4")), staged_file_name(Some("a.mp4")));
    }

    #[tokio::test]
    async fn test_staged_upload_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedUpload::write(dir.path(), Some("clip.mp4"), b"not a video")
            .await
            .unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert!(path.starts_with(dir.path()));

        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_staged_upload_tolerates_external_removal() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedUpload::write(dir.path(), None, b"x").await.unwrap();
        std::fs::remove_file(staged.path()).unwrap();
        drop(staged);
    }

    #[tokio::test]
    async fn test_ffmpeg_opener_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedUpload::write(dir.path(), Some("bad.mp4"), b"definitely not a video")
            .await
            .unwrap();

        // Fails whether or not ffmpeg is installed
        assert!(FfmpegVideoOpener::default().open(staged.path()).await.is_err());
    }

    #[cfg(unix)]
    fn stand_in_decoder(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .args(["-c", script])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_decoder_failure_after_frames_is_an_error() {
        let child = stand_in_decoder("printf 'abc'; echo 'corrupt macroblock' >&2; exit 3");
        let mut session = FfmpegVideoSession::from_child(child, dims(1, 1)).unwrap();

        assert!(session.next_frame().await.unwrap().is_some());
        let err = session.next_frame().await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("after 1 frames"), "{}", message);
        assert!(message.contains("corrupt macroblock"), "{}", message);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_decoder_failure_on_truncated_frame_is_an_error() {
        let child = stand_in_decoder("printf 'ab'; exit 1");
        let mut session = FfmpegVideoSession::from_child(child, dims(1, 1)).unwrap();

        assert!(session.next_frame().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_decoder_exit_ends_stream() {
        let child = stand_in_decoder("printf 'abcdef'; exit 0");
        let mut session = FfmpegVideoSession::from_child(child, dims(1, 1)).unwrap();

        assert!(session.next_frame().await.unwrap().is_some());
        assert!(session.next_frame().await.unwrap().is_some());
        assert!(session.next_frame().await.unwrap().is_none());
        assert!(session.next_frame().await.unwrap().is_none());
    }

    fn tool_available(tool: &str) -> bool {
        std::process::Command::new(tool)
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run_ffmpeg(args: &[&str]) -> bool {
        std::process::Command::new("ffmpeg")
            .args(["-v", "error", "-y"])
            .args(args)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Three 64x32 frames
    fn synthesize_clip(dir: &Path) -> Option<PathBuf> {
        let path = dir.join("clip.mp4");
        let ok = run_ffmpeg(&[
            "-f",
            "lavfi",
            "-i",
            "testsrc=size=64x32:rate=5",
            "-frames:v",
            "3",
            "-c:v",
            "mpeg4",
            "-pix_fmt",
            "yuv420p",
            path.to_str()?,
        ]);
        ok.then_some(path)
    }

    /// The same clip flagged for display rotated by a quarter turn
    fn rotate_clip(source: &Path, dir: &Path) -> Option<PathBuf> {
        let path = dir.join("rotated.mp4");
        let (src, dst) = (source.to_str()?, path.to_str()?);
        let ok = run_ffmpeg(&["-display_rotation", "90", "-i", src, "-c", "copy", dst])
            || run_ffmpeg(&["-i", src, "-c", "copy", "-metadata:s:v:0", "rotate=90", dst]);
        ok.then_some(path)
    }

    async fn decode_all(opener: &FfmpegVideoOpener, path: &Path) -> Vec<RgbImage> {
        let mut source = opener.open(path).await.unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = source.next_frame().await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_ffmpeg_opener_decodes_clip() {
        if !tool_available("ffmpeg") || !tool_available("ffprobe") {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let clip = synthesize_clip(dir.path()).unwrap();

        let frames = decode_all(&FfmpegVideoOpener::default(), &clip).await;

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.dimensions() == (64, 32)));
    }

    #[tokio::test]
    async fn test_ffmpeg_opener_follows_display_rotation() {
        if !tool_available("ffmpeg") || !tool_available("ffprobe") {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let clip = synthesize_clip(dir.path()).unwrap();
        let rotated = rotate_clip(&clip, dir.path()).unwrap();

        let frames = decode_all(&FfmpegVideoOpener::default(), &rotated).await;

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.dimensions() == (32, 64)));
    }

    #[tokio::test]
    async fn test_ffmpeg_opener_refuses_oversized_frames() {
        if !tool_available("ffmpeg") || !tool_available("ffprobe") {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let clip = synthesize_clip(dir.path()).unwrap();

        assert!(FfmpegVideoOpener::new(64 * 32).open(&clip).await.is_ok());
        assert!(FfmpegVideoOpener::new(64 * 32 - 1).open(&clip).await.is_err());
    }
}
