//! Video frame sources.
//!
//! A source yields decoded RGB frames of a fixed size until the end of the
//! stream. Video files and stream URIs are decoded by an `ffmpeg` child
//! process; a directory of still images is replayed in file-name order.

use async_trait::async_trait;
use image::imageops::FilterType;
use image::RgbImage;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("video source not found: {0}")]
    NotFound(String),

    #[error("video source {uri} is unreadable: {reason}")]
    Unreadable { uri: String, reason: String },

    #[error("no frames found in {0}")]
    Empty(String),

    #[error("frame read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
}

impl SourceError {
    fn unreadable(uri: &str, reason: impl ToString) -> Self {
        Self::Unreadable {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Human-readable origin of the frames
    fn describe(&self) -> &str;

    /// Frame size, fixed for the lifetime of the source
    fn dimensions(&self) -> (u32, u32);

    /// Next decoded frame, `None` at end of stream
    async fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

/// Open a directory as an image sequence, anything else through ffmpeg
pub async fn open_source(source: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    match tokio::fs::metadata(source).await {
        Ok(meta) if meta.is_dir() => Ok(Box::new(ImageSequenceSource::open(source).await?)),
        _ => Ok(Box::new(FfmpegFrameSource::open(source).await?)),
    }
}

fn is_remote(uri: &str) -> bool {
    uri.contains("://")
}

/// Decodes a video file or stream into raw RGB frames with ffmpeg.
///
/// ffmpeg runs with `-noautorotate` so the frames it emits keep the coded size
/// ffprobe reports. The first frame is read while opening, so a source that
/// decodes nothing is rejected before a run starts.
pub struct FfmpegFrameSource {
    uri: String,
    width: u32,
    height: u32,
    first: Option<RgbImage>,
    // Held so the decoder is killed when the source is dropped
    _child: Child,
    stdout: ChildStdout,
}

impl FfmpegFrameSource {
    pub async fn open(uri: &str) -> Result<Self, SourceError> {
        if !is_remote(uri) && !Path::new(uri).exists() {
            return Err(SourceError::NotFound(uri.to_string()));
        }

        let (width, height) = probe_dimensions(uri).await?;

        let mut child = Command::new("ffmpeg")
            .args(decoder_args(uri))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::unreadable(uri, format!("failed to execute ffmpeg: {}", e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::unreadable(uri, "ffmpeg stdout is not piped"))?;

        let first = read_raw_frame(&mut stdout, width, height)
            .await?
            .ok_or_else(|| SourceError::Empty(uri.to_string()))?;

        info!(source = %uri, width, height, "opened video source");

        Ok(Self {
            uri: uri.to_string(),
            width,
            height,
            first: Some(first),
            _child: child,
            stdout,
        })
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    fn describe(&self) -> &str {
        &self.uri
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    async fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }

        let frame = read_raw_frame(&mut self.stdout, self.width, self.height).await?;
        if frame.is_none() {
            debug!(source = %self.uri, "video source exhausted");
        }
        Ok(frame)
    }
}

fn decoder_args(uri: &str) -> [&str; 11] {
    [
        "-nostdin",
        "-loglevel",
        "error",
        "-noautorotate",
        "-i",
        uri,
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
        "pipe:1",
    ]
}

/// Read one packed rgb24 frame. A truncated final frame is treated as the
/// end of the stream.
async fn read_raw_frame<R>(
    reader: &mut R,
    width: u32,
    height: u32,
) -> Result<Option<RgbImage>, SourceError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; width as usize * height as usize * 3];
    match reader.read_exact(&mut buffer).await {
        Ok(_) => Ok(RgbImage::from_raw(width, height, buffer)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Frame dimensions of the first video stream, via ffprobe
async fn probe_dimensions(uri: &str) -> Result<(u32, u32), SourceError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0",
            uri,
        ])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| SourceError::unreadable(uri, format!("failed to execute ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(SourceError::unreadable(
            uri,
            format!("ffprobe exited with {}", output.status),
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&text)
        .ok_or_else(|| SourceError::unreadable(uri, format!("unexpected ffprobe output: {:?}", text.trim())))
}

/// Parse `width,height` from ffprobe's csv output
fn parse_probe_output(output: &str) -> Option<(u32, u32)> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split(',').map(str::trim).filter(|f| !f.is_empty());
    let width: u32 = fields.next()?.parse().ok()?;
    let height: u32 = fields.next()?.parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Replays a directory of still images as video frames.
///
/// The first image fixes the frame size; later images of a different size
/// are resized to it.
pub struct ImageSequenceSource {
    dir: String,
    width: u32,
    height: u32,
    first: Option<RgbImage>,
    remaining: VecDeque<PathBuf>,
}

impl ImageSequenceSource {
    pub async fn open(dir: &str) -> Result<Self, SourceError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SourceError::NotFound(dir.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_image(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut remaining: VecDeque<PathBuf> = paths.into();
        let first_path = remaining
            .pop_front()
            .ok_or_else(|| SourceError::Empty(dir.to_string()))?;
        let first = load_rgb(first_path).await?;
        let (width, height) = first.dimensions();

        info!(
            source = %dir,
            width,
            height,
            frames = remaining.len() + 1,
            "opened image sequence"
        );

        Ok(Self {
            dir: dir.to_string(),
            width,
            height,
            first: Some(first),
            remaining,
        })
    }
}

#[async_trait]
impl FrameSource for ImageSequenceSource {
    fn describe(&self) -> &str {
        &self.dir
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    async fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }

        let Some(path) = self.remaining.pop_front() else {
            return Ok(None);
        };

        let frame = load_rgb(path).await?;
        if frame.dimensions() == (self.width, self.height) {
            Ok(Some(frame))
        } else {
            Ok(Some(image::imageops::resize(
                &frame,
                self.width,
                self.height,
                FilterType::Triangle,
            )))
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

async fn load_rgb(path: PathBuf) -> Result<RgbImage, SourceError> {
    let display = path.display().to_string();
    tokio::task::spawn_blocking(move || image::open(&path).map(|img| img.to_rgb8()))
        .await
        .map_err(|e| SourceError::unreadable(&display, e))?
        .map_err(SourceError::from)
}
