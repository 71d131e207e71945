use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::errors::{Result, StreamError};

/// Which job an ffmpeg process is doing; used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Preview,
    Recording,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Preview => write!(f, "preview"),
            Role::Recording => write!(f, "recording"),
        }
    }
}

pub struct PreviewOptions<'a> {
    pub rtsp_url: &'a str,
    pub transport: &'a str,
    pub frame_rate: u32,
    pub jpeg_quality: u8,
    pub low_latency: bool,
    pub extra_input_args: &'a [String],
    pub output_pattern: &'a Path,
}

pub struct RecordingOptions<'a> {
    pub rtsp_url: &'a str,
    pub transport: &'a str,
    pub video_codec: &'a str,
    pub fps: u32,
    pub extra_input_args: &'a [String],
    pub output_path: &'a Path,
}

/// Map a 1-100 JPEG quality onto ffmpeg's mjpeg `-q:v` scale (2 best, 31 worst).
pub fn jpeg_quality_to_qscale(quality: u8) -> u8 {
    let quality = quality.clamp(1, 100) as u32;
    (31 - (quality - 1) * 29 / 99) as u8
}

fn input_args(rtsp_url: &str, transport: &str, low_latency: bool, extra: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];
    if low_latency {
        args.extend(
            ["-fflags", "+nobuffer+discardcorrupt", "-flags", "low_delay"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    args.extend_from_slice(&["-rtsp_transport".into(), transport.to_string()]);
    args.extend(extra.iter().cloned());
    args.extend_from_slice(&["-i".into(), rtsp_url.to_string()]);
    args
}

/// RTSP to a numbered JPEG sequence in the frame directory.
pub fn preview_args(opts: &PreviewOptions<'_>) -> Vec<String> {
    let mut args = input_args(opts.rtsp_url, opts.transport, opts.low_latency, opts.extra_input_args);
    args.extend_from_slice(&[
        "-an".into(),
        "-vf".into(),
        format!("fps={}", opts.frame_rate),
        "-q:v".into(),
        jpeg_quality_to_qscale(opts.jpeg_quality).to_string(),
        "-f".into(),
        "image2".into(),
        "-y".into(),
        opts.output_pattern.to_string_lossy().into_owned(),
    ]);
    args
}

/// RTSP to an MP4 file. `copy` stream-copies the camera's video; any other
/// codec re-encodes at `fps`.
pub fn recording_args(opts: &RecordingOptions<'_>) -> Vec<String> {
    let mut args = input_args(opts.rtsp_url, opts.transport, false, opts.extra_input_args);

    if opts.video_codec == "copy" {
        args.extend_from_slice(&["-c:v".into(), "copy".into()]);
    } else {
        args.extend_from_slice(&[
            "-c:v".into(),
            opts.video_codec.to_string(),
            "-r".into(),
            opts.fps.to_string(),
        ]);
    }

    args.extend_from_slice(&[
        "-an".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-f".into(),
        "mp4".into(),
        "-y".into(),
        opts.output_path.to_string_lossy().into_owned(),
    ]);
    args
}

pub struct FfmpegProcess {
    role: Role,
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Spawn ffmpeg. stdin stays open so the process can be asked to quit with `q`.
pub fn spawn(binary: &str, args: &[String], role: Role, log_stderr: bool) -> Result<FfmpegProcess> {
    debug!("Spawning {} ffmpeg: {} {}", role, binary, args.join(" "));

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(if log_stderr { Stdio::piped() } else { Stdio::null() })
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StreamError::FfmpegNotFound { binary: binary.to_string() }
            } else {
                StreamError::Io { source: e }
            }
        })?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    warn!("ffmpeg [{}]: {}", role, line);
                }
            }
        });
    }

    let stdin = child.stdin.take();
    info!("Started {} ffmpeg (pid {:?})", role, child.id());
    Ok(FfmpegProcess { role, child, stdin })
}

impl FfmpegProcess {
    pub fn role(&self) -> Role {
        self.role
    }

    /// `Some(status)` once the process has exited on its own.
    pub fn try_exited(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Ask ffmpeg to finish (so MP4 files get their index written), then kill
    /// it if it has not exited within `grace`.
    pub async fn stop(mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.child.try_wait()? {
            debug!("{} ffmpeg had already exited: {}", self.role, status);
            return Ok(Some(status));
        }

        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!("Could not send quit to {} ffmpeg: {}", self.role, e);
            }
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!("{} ffmpeg exited: {}", self.role, status);
                Ok(Some(status))
            }
            Err(_) => {
                warn!("{} ffmpeg did not exit within {:?}, killing it", self.role, grace);
                self.child.kill().await?;
                Ok(None)
            }
        }
    }
}

/// Run `<binary> -version` and return the first line of its output.
pub async fn probe_binary(binary: &str) -> Result<String> {
    let output = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StreamError::FfmpegNotFound { binary: binary.to_string() }
            } else {
                StreamError::Io { source: e }
            }
        })?;

    if !output.status.success() {
        return Err(StreamError::ffmpeg(format!("'{} -version' exited with {}", binary, output.status)));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string())
}

/// Width and height from a JPEG header.
pub fn frame_dimensions(jpeg: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::with_format(std::io::Cursor::new(jpeg), image::ImageFormat::Jpeg)
        .into_dimensions()
        .ok()
}
