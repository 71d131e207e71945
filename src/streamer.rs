use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{Result, StreamError};
use crate::frame_buffer::FrameBuffer;
use crate::frame_poller::{FrameDirectory, FramePoller, PollOutcome};
use crate::recorder::{Recorder, RecordingSummary};
use crate::transcoder::{self, FfmpegProcess, PreviewOptions, Role};
use crate::utils::redact_url;

#[derive(Debug, Default)]
struct StreamStatus {
    streaming: AtomicBool,
    connected: AtomicBool,
    frames_received: AtomicU64,
    reconnects: AtomicU32,
    resolution: RwLock<Option<(u32, u32)>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub streaming: bool,
    pub recording: bool,
    pub connected: bool,
    pub frames_received: u64,
    pub reconnects: u32,
    pub resolution: Option<String>,
    pub recording_file: Option<PathBuf>,
    pub recording_started_at: Option<DateTime<Utc>>,
}

/// Everything the stream loop needs, shared between the streamer and its task.
struct StreamContext {
    config: Arc<Config>,
    rtsp_url: String,
    status: StreamStatus,
    recorder: Mutex<Recorder>,
}

/// Owns the preview ffmpeg, the polling loop that feeds the frame buffer,
/// and the recorder.
pub struct RtspStreamer {
    ctx: Arc<StreamContext>,
    buffer: FrameBuffer,
    directory: FrameDirectory,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RtspStreamer {
    pub fn new(config: Arc<Config>, buffer: FrameBuffer) -> Result<Self> {
        let rtsp_url = config.camera.rtsp_url()?;
        let recorder = Recorder::new(
            config.recording.clone(),
            config.ffmpeg.clone(),
            config.camera.transport.clone(),
        );
        let directory = FrameDirectory::new(
            config.streaming.frame_directory.clone(),
            config.streaming.frame_retention,
        );
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            ctx: Arc::new(StreamContext {
                config,
                rtsp_url,
                status: StreamStatus::default(),
                recorder: Mutex::new(recorder),
            }),
            buffer,
            directory,
            stop_tx,
            task: None,
        })
    }

    pub fn is_streaming(&self) -> bool {
        self.ctx.status.streaming.load(Ordering::SeqCst)
    }

    /// Connect to the camera (with bounded retries) and start the polling
    /// loop. Returns once the first frame has arrived.
    pub async fn start_streaming(&mut self) -> Result<()> {
        if self.is_streaming() {
            debug!("Stream already running");
            return Ok(());
        }
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();

        let streaming = &self.ctx.config.streaming;
        let mut poller = FramePoller::new(
            self.directory.clone(),
            self.buffer.clone(),
            streaming.poll_interval,
            streaming.watch_events,
        )
        .await?;

        info!("Starting stream from {}", redact_url(&self.ctx.rtsp_url));
        let process = connect(&self.ctx, &mut poller, &mut stop_rx).await?;

        self.ctx.status.streaming.store(true, Ordering::SeqCst);
        let ctx = self.ctx.clone();
        self.task = Some(tokio::spawn(run_stream_loop(ctx, process, poller, stop_rx)));
        Ok(())
    }

    /// Stop recording, the preview ffmpeg and the polling loop, and clear the
    /// frame directory and buffer.
    pub async fn stop_streaming(&mut self) -> Result<()> {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Stream task ended abnormally: {}", e);
            }
        }
        // The loop also stops recording on exit; this covers a loop that
        // already ended after a failed reconnect.
        self.ctx.recorder.lock().await.stop().await?;
        self.ctx.status.streaming.store(false, Ordering::SeqCst);
        self.ctx.status.connected.store(false, Ordering::SeqCst);
        self.directory.clear().await?;
        self.buffer.clear().await;
        info!("Stream stopped");
        Ok(())
    }

    pub async fn start_recording(&self) -> Result<PathBuf> {
        if !self.is_streaming() || !self.ctx.status.connected.load(Ordering::SeqCst) {
            return Err(StreamError::NotStreaming);
        }
        self.ctx.recorder.lock().await.start(&self.ctx.rtsp_url).await
    }

    pub async fn stop_recording(&self) -> Result<Option<RecordingSummary>> {
        self.ctx.recorder.lock().await.stop().await
    }

    pub async fn status(&self) -> StatusSnapshot {
        let status = &self.ctx.status;
        let mut recorder = self.ctx.recorder.lock().await;
        let recording = recorder.is_recording();
        StatusSnapshot {
            streaming: status.streaming.load(Ordering::SeqCst),
            recording,
            connected: status.connected.load(Ordering::SeqCst),
            frames_received: status.frames_received.load(Ordering::Relaxed),
            reconnects: status.reconnects.load(Ordering::Relaxed),
            resolution: status.resolution.read().await.map(|(w, h)| format!("{}x{}", w, h)),
            recording_file: recorder.current_path().map(|p| p.to_path_buf()),
            recording_started_at: recorder.started_at(),
        }
    }
}

/// Spawn the preview ffmpeg and wait for its first frame, retrying up to
/// `reconnect_attempts` times.
async fn connect(
    ctx: &StreamContext,
    poller: &mut FramePoller,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<FfmpegProcess> {
    let streaming = &ctx.config.streaming;
    let max_attempts = streaming.reconnect_attempts.max(1);

    for attempt in 1..=max_attempts {
        if *stop_rx.borrow() {
            return Err(StreamError::connection("Stopped while connecting"));
        }
        info!("Attempting to connect to RTSP stream (attempt {}/{})", attempt, max_attempts);
        match try_connect(ctx, poller, stop_rx).await {
            Ok(process) => {
                info!("Connected to RTSP stream: {}", redact_url(&ctx.rtsp_url));
                return Ok(process);
            }
            Err(e @ StreamError::FfmpegNotFound { .. }) => return Err(e),
            Err(e) if *stop_rx.borrow() => return Err(e),
            Err(e) => warn!("Connection attempt {} failed: {}", attempt, e),
        }

        if attempt < max_attempts {
            info!("Retrying in {:?}...", streaming.reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(streaming.reconnect_delay) => {}
                _ = stop_rx.changed() => {}
            }
        }
    }

    Err(StreamError::connection(format!("Failed to connect after {} attempts", max_attempts)))
}

async fn try_connect(
    ctx: &StreamContext,
    poller: &mut FramePoller,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<FfmpegProcess> {
    let streaming = &ctx.config.streaming;
    let ffmpeg = &ctx.config.ffmpeg;

    poller.directory().prepare().await?;
    poller.reset();

    let output_pattern = poller.directory().output_pattern();
    let args = transcoder::preview_args(&PreviewOptions {
        rtsp_url: &ctx.rtsp_url,
        transport: &ctx.config.camera.transport,
        frame_rate: streaming.frame_rate,
        jpeg_quality: ctx.config.recording.jpeg_quality,
        low_latency: streaming.low_latency,
        extra_input_args: &ffmpeg.extra_input_args,
        output_pattern: &output_pattern,
    });
    let mut process = transcoder::spawn(&ffmpeg.binary, &args, Role::Preview, ffmpeg.log_stderr)?;

    let deadline = Instant::now() + streaming.first_frame_timeout;
    loop {
        let sender_gone = tokio::select! {
            _ = poller.tick() => false,
            changed = stop_rx.changed() => changed.is_err(),
        };
        if sender_gone || *stop_rx.borrow() {
            process.stop(ffmpeg.stop_grace).await?;
            return Err(StreamError::connection("Stopped while connecting"));
        }

        if let PollOutcome::NewFrame(frame) = poller.poll_once().await? {
            ctx.status.connected.store(true, Ordering::SeqCst);
            ctx.status.frames_received.fetch_add(1, Ordering::Relaxed);
            if let Some((width, height)) = transcoder::frame_dimensions(&frame.data) {
                info!("Video properties: {}x{} @ {} FPS", width, height, streaming.frame_rate);
                *ctx.status.resolution.write().await = Some((width, height));
            }
            return Ok(process);
        }

        if let Some(status) = process.try_exited()? {
            return Err(StreamError::ffmpeg(format!("{} ffmpeg exited before the first frame: {}", process.role(), status)));
        }

        if Instant::now() >= deadline {
            process.stop(ffmpeg.stop_grace).await?;
            return Err(StreamError::connection(format!(
                "No frame received within {:?}",
                streaming.first_frame_timeout
            )));
        }
    }
}

async fn run_stream_loop(
    ctx: Arc<StreamContext>,
    process: FfmpegProcess,
    mut poller: FramePoller,
    mut stop_rx: watch::Receiver<bool>,
) {
    let streaming = &ctx.config.streaming;
    let grace = ctx.config.ffmpeg.stop_grace;
    let mut process = Some(process);
    let mut last_frame_at = Instant::now();

    info!("Stream loop started");
    loop {
        tokio::select! {
            _ = poller.tick() => {}
            changed = stop_rx.changed() => {
                // Sender gone means the streamer was dropped.
                if changed.is_err() {
                    break;
                }
            }
        }
        if *stop_rx.borrow() {
            break;
        }

        match poller.poll_once().await {
            Ok(PollOutcome::NewFrame(_)) => {
                last_frame_at = Instant::now();
                ctx.status.connected.store(true, Ordering::SeqCst);
                let count = ctx.status.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 500 == 0 {
                    debug!("Received {} frames from camera", count);
                }
            }
            Ok(PollOutcome::NoChange) => {}
            Err(e) => warn!("Failed to poll frame directory: {}", e),
        }

        let failure = match process.as_mut().map(|p| p.try_exited()) {
            Some(Ok(Some(status))) => Some(format!("preview ffmpeg exited: {}", status)),
            Some(Err(e)) => Some(format!("could not check preview ffmpeg: {}", e)),
            _ if last_frame_at.elapsed() >= streaming.stall_timeout => {
                Some(format!("no new frame for {:?}", streaming.stall_timeout))
            }
            _ => None,
        };

        let Some(reason) = failure else {
            continue;
        };

        warn!("Stream interrupted ({}), attempting to reconnect...", reason);
        ctx.status.connected.store(false, Ordering::SeqCst);
        if let Some(old) = process.take() {
            if let Err(e) = old.stop(grace).await {
                warn!("Failed to stop preview ffmpeg: {}", e);
            }
        }

        match connect(&ctx, &mut poller, &mut stop_rx).await {
            Ok(new_process) => {
                process = Some(new_process);
                last_frame_at = Instant::now();
                ctx.status.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) if *stop_rx.borrow() => break,
            Err(e) => {
                error!("Reconnection failed, stopping stream: {}", e);
                break;
            }
        }
    }

    if let Some(process) = process.take() {
        if let Err(e) = process.stop(grace).await {
            warn!("Failed to stop preview ffmpeg: {}", e);
        }
    }
    if let Err(e) = ctx.recorder.lock().await.stop().await {
        warn!("Failed to stop recording: {}", e);
    }
    if let Err(e) = poller.directory().clear().await {
        warn!("Failed to clear frame directory: {}", e);
    }
    ctx.status.connected.store(false, Ordering::SeqCst);
    ctx.status.streaming.store(false, Ordering::SeqCst);
    info!("Stream loop ended");
}
