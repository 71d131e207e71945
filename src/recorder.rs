use std::path::{Path, PathBuf};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{FfmpegConfig, RecordingConfig};
use crate::errors::{Result, StreamError};
use crate::transcoder::{self, FfmpegProcess, RecordingOptions, Role};

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingFile {
    pub file_name: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

struct ActiveRecording {
    path: PathBuf,
    started_at: DateTime<Utc>,
    process: FfmpegProcess,
}

/// Runs a second ffmpeg that writes the camera stream to an MP4 file.
pub struct Recorder {
    recording: RecordingConfig,
    ffmpeg: FfmpegConfig,
    transport: String,
    active: Option<ActiveRecording>,
}

impl Recorder {
    pub fn new(recording: RecordingConfig, ffmpeg: FfmpegConfig, transport: String) -> Self {
        Self {
            recording,
            ffmpeg,
            transport,
            active: None,
        }
    }

    pub async fn start(&mut self, rtsp_url: &str) -> Result<PathBuf> {
        if self.is_recording() {
            let path = self.current_path().map(|p| p.display().to_string()).unwrap_or_default();
            return Err(StreamError::AlreadyRecording { path });
        }

        let output_dir = &self.recording.output_directory;
        tokio::fs::create_dir_all(output_dir).await?;
        let output_path = unique_recording_path(output_dir, Local::now());

        let args = transcoder::recording_args(&RecordingOptions {
            rtsp_url,
            transport: &self.transport,
            video_codec: &self.recording.video_codec,
            fps: self.recording.default_fps,
            extra_input_args: &self.ffmpeg.extra_input_args,
            output_path: &output_path,
        });
        let process = transcoder::spawn(&self.ffmpeg.binary, &args, Role::Recording, self.ffmpeg.log_stderr)?;

        info!("Started recording to: {}", output_path.display());
        self.active = Some(ActiveRecording {
            path: output_path.clone(),
            started_at: Utc::now(),
            process,
        });
        Ok(output_path)
    }

    /// Stop the current recording. Returns `None` when nothing was recording.
    pub async fn stop(&mut self) -> Result<Option<RecordingSummary>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };

        active.process.stop(self.ffmpeg.stop_grace).await?;

        let size_bytes = match tokio::fs::metadata(&active.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Recording file {} is missing: {}", active.path.display(), e);
                0
            }
        };
        let summary = RecordingSummary {
            duration_secs: (Utc::now() - active.started_at).num_seconds(),
            path: active.path,
            started_at: active.started_at,
            size_bytes,
        };
        info!(
            "Recording stopped: {} ({} s, {} bytes)",
            summary.path.display(),
            summary.duration_secs,
            summary.size_bytes
        );
        Ok(Some(summary))
    }

    /// True while the recording ffmpeg is alive. A process that exited on its
    /// own is reaped here.
    pub fn is_recording(&mut self) -> bool {
        let exited = match self.active.as_mut() {
            None => return false,
            Some(active) => match active.process.try_exited() {
                Ok(None) => false,
                Ok(Some(status)) => {
                    warn!("Recording ffmpeg for {} exited: {}", active.path.display(), status);
                    true
                }
                Err(e) => {
                    warn!("Could not check recording ffmpeg: {}", e);
                    true
                }
            },
        };
        if exited {
            self.active = None;
        }
        !exited
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.active.as_ref().map(|a| a.started_at)
    }
}

/// `recording_YYYYMMDD_HHMMSS.mp4`
pub fn recording_file_name(timestamp: DateTime<Local>) -> String {
    format!("recording_{}.mp4", timestamp.format("%Y%m%d_%H%M%S"))
}

fn unique_recording_path(dir: &Path, timestamp: DateTime<Local>) -> PathBuf {
    let base = recording_file_name(timestamp);
    let mut path = dir.join(&base);
    let stem = base.trim_end_matches(".mp4").to_string();
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.mp4", stem, n));
        n += 1;
    }
    path
}

/// MP4 files in `dir`, newest first.
pub async fn list_recordings(dir: &Path) -> Result<Vec<RecordingFile>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("mp4") {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        files.push(RecordingFile {
            file_name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.file_name.cmp(&a.file_name)));
    Ok(files)
}
