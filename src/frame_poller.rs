use std::path::{Path, PathBuf};
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::errors::Result;
use crate::frame_buffer::{Frame, FrameBuffer};
use crate::watcher::{self, FrameWatcher};

const FRAME_PREFIX: &str = "frame_";
const FRAME_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFile {
    pub sequence: u64,
    pub path: PathBuf,
}

/// The directory ffmpeg writes `frame_<n>.jpg` files into.
#[derive(Debug, Clone)]
pub struct FrameDirectory {
    dir: PathBuf,
    retention: usize,
}

impl FrameDirectory {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention: retention.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Output pattern handed to ffmpeg's image2 muxer.
    pub fn output_pattern(&self) -> PathBuf {
        self.dir.join(format!("{}%06d.{}", FRAME_PREFIX, FRAME_EXTENSION))
    }

    /// Create the directory and drop frames left over from a previous run.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let removed = self.clear().await?;
        if removed > 0 {
            debug!("Removed {} stale frames from '{}'", removed, self.dir.display());
        }
        Ok(())
    }

    /// Frame files sorted oldest first.
    pub async fn list_frames(&self) -> Result<Vec<FrameFile>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut frames = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(sequence) = name.to_str().and_then(parse_frame_sequence) {
                frames.push(FrameFile { sequence, path: entry.path() });
            }
        }
        frames.sort_by_key(|f| f.sequence);
        Ok(frames)
    }

    /// Read the newest complete frame whose sequence is greater than `after`.
    /// A file that is still being written is skipped in favour of the one
    /// before it.
    pub async fn read_newest(&self, frames: &[FrameFile], after: Option<u64>) -> Result<Option<(u64, Bytes)>> {
        for frame in frames.iter().rev() {
            if after.map_or(false, |last| frame.sequence <= last) {
                break;
            }
            let data = match tokio::fs::read(&frame.path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if is_complete_jpeg(&data) {
                return Ok(Some((frame.sequence, Bytes::from(data))));
            }
            trace!("Frame {} is incomplete, trying an older one", frame.path.display());
        }
        Ok(None)
    }

    /// Delete all but the newest `retention` frames. `frames` must be sorted
    /// oldest first.
    pub async fn prune(&self, frames: &[FrameFile]) -> Result<usize> {
        let excess = frames.len().saturating_sub(self.retention);
        let mut removed = 0;
        for frame in &frames[..excess] {
            match tokio::fs::remove_file(&frame.path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove old frame {}: {}", frame.path.display(), e),
            }
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<usize> {
        let frames = self.list_frames().await?;
        let mut removed = 0;
        for frame in frames {
            match tokio::fs::remove_file(&frame.path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

/// `frame_000042.jpg` -> `42`
pub fn parse_frame_sequence(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(FRAME_PREFIX)?
        .strip_suffix(FRAME_EXTENSION)?
        .strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// JPEG start-of-image at the front and end-of-image at the back.
pub fn is_complete_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&[0xFF, 0xD8]) && data.ends_with(&[0xFF, 0xD9])
}

#[derive(Debug)]
pub enum PollOutcome {
    NewFrame(Frame),
    NoChange,
}

pub struct FramePoller {
    directory: FrameDirectory,
    buffer: FrameBuffer,
    ticker: Interval,
    wake: Option<mpsc::Receiver<()>>,
    _watcher: Option<FrameWatcher>,
    last_sequence: Option<u64>,
}

impl FramePoller {
    /// Creates the frame directory. With `watch_events` a filesystem watcher
    /// wakes the poller early; if it cannot be installed the poller falls
    /// back to the fixed interval.
    pub async fn new(
        directory: FrameDirectory,
        buffer: FrameBuffer,
        poll_interval: Duration,
        watch_events: bool,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(directory.path()).await?;

        let (watcher, wake) = if watch_events {
            match watcher::watch_frame_directory(directory.path()) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(e) => {
                    warn!("Falling back to plain polling of '{}': {}", directory.path().display(), e);
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(Self {
            directory,
            buffer,
            ticker,
            wake,
            _watcher: watcher,
            last_sequence: None,
        })
    }

    pub fn directory(&self) -> &FrameDirectory {
        &self.directory
    }

    /// Forget the last published sequence; ffmpeg restarts numbering from 1.
    pub fn reset(&mut self) {
        self.last_sequence = None;
    }

    /// Wait for the next poll: one interval, or earlier on a filesystem event.
    pub async fn tick(&mut self) {
        match self.wake.as_mut() {
            Some(wake) => {
                tokio::select! {
                    _ = self.ticker.tick() => {}
                    Some(()) = wake.recv() => {}
                }
            }
            None => {
                self.ticker.tick().await;
            }
        }
    }

    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let frames = self.directory.list_frames().await?;

        let outcome = match self.directory.read_newest(&frames, self.last_sequence).await? {
            Some((sequence, data)) => {
                self.last_sequence = Some(sequence);
                PollOutcome::NewFrame(self.buffer.publish(data).await)
            }
            None => PollOutcome::NoChange,
        };

        let removed = self.directory.prune(&frames).await?;
        if removed > 0 {
            trace!("Pruned {} old frames", removed);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend_from_slice(payload);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    fn write_frame(dir: &Path, sequence: u64, data: &[u8]) {
        std::fs::write(dir.join(format!("frame_{:06}.jpg", sequence)), data).unwrap();
    }

    async fn poller(dir: &TempDir, retention: usize) -> (FramePoller, FrameBuffer) {
        let buffer = FrameBuffer::new(8);
        let poller = FramePoller::new(
            FrameDirectory::new(dir.path(), retention),
            buffer.clone(),
            Duration::from_millis(10),
            false,
        )
        .await
        .unwrap();
        (poller, buffer)
    }

    #[test]
    fn test_parse_frame_sequence() {
        assert_eq!(parse_frame_sequence("frame_000001.jpg"), Some(1));
        assert_eq!(parse_frame_sequence("frame_1234567.jpg"), Some(1234567));
        assert_eq!(parse_frame_sequence("frame_.jpg"), None);
        assert_eq!(parse_frame_sequence("frame_12a.jpg"), None);
        assert_eq!(parse_frame_sequence("frame_000001.png"), None);
        assert_eq!(parse_frame_sequence("recording_000001.jpg"), None);
        assert_eq!(parse_frame_sequence("frame_000001jpg"), None);
    }

    #[test]
    fn test_is_complete_jpeg() {
        assert!(is_complete_jpeg(&jpeg(b"data")));
        assert!(!is_complete_jpeg(&[0xFF, 0xD8, 0x00, 0x01]));
        assert!(!is_complete_jpeg(&[0xFF, 0xD9]));
        assert!(!is_complete_jpeg(b""));
    }

    #[test]
    fn test_output_pattern() {
        let dir = FrameDirectory::new("/tmp/frames", 5);
        assert_eq!(dir.output_pattern(), PathBuf::from("/tmp/frames/frame_%06d.jpg"));
    }

    #[tokio::test]
    async fn test_poll_publishes_newest_and_keeps_five() {
        let dir = TempDir::new().unwrap();
        let (mut poller, buffer) = poller(&dir, 5).await;

        for sequence in 1..=8 {
            write_frame(dir.path(), sequence, &jpeg(format!("frame {}", sequence).as_bytes()));
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        match poller.poll_once().await.unwrap() {
            PollOutcome::NewFrame(frame) => assert_eq!(frame.data, Bytes::from(jpeg(b"frame 8"))),
            PollOutcome::NoChange => panic!("expected a new frame"),
        }
        assert_eq!(buffer.latest().await.unwrap().data, Bytes::from(jpeg(b"frame 8")));

        let remaining: Vec<u64> = poller.directory().list_frames().await.unwrap()
            .into_iter()
            .map(|f| f.sequence)
            .collect();
        assert_eq!(remaining, vec![4, 5, 6, 7, 8]);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_poll_without_new_frame_reports_no_change() {
        let dir = TempDir::new().unwrap();
        let (mut poller, _buffer) = poller(&dir, 5).await;

        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NoChange));

        write_frame(dir.path(), 1, &jpeg(b"one"));
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NewFrame(_)));
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NoChange));

        write_frame(dir.path(), 2, &jpeg(b"two"));
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NewFrame(_)));
    }

    #[tokio::test]
    async fn test_poll_skips_partially_written_frame() {
        let dir = TempDir::new().unwrap();
        let (mut poller, buffer) = poller(&dir, 5).await;

        write_frame(dir.path(), 1, &jpeg(b"complete"));
        write_frame(dir.path(), 2, &[0xFF, 0xD8, 0x01, 0x02]);

        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NewFrame(_)));
        assert_eq!(buffer.latest().await.unwrap().data, Bytes::from(jpeg(b"complete")));

        // Once the newer file is finished it gets picked up.
        write_frame(dir.path(), 2, &jpeg(b"finished"));
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NewFrame(_)));
        assert_eq!(buffer.latest().await.unwrap().data, Bytes::from(jpeg(b"finished")));
    }

    #[tokio::test]
    async fn test_reset_accepts_restarted_numbering() {
        let dir = TempDir::new().unwrap();
        let (mut poller, _buffer) = poller(&dir, 5).await;

        write_frame(dir.path(), 10, &jpeg(b"ten"));
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NewFrame(_)));

        poller.directory().prepare().await.unwrap();
        poller.reset();
        write_frame(dir.path(), 1, &jpeg(b"restart"));
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NewFrame(_)));
    }

    #[tokio::test]
    async fn test_prepare_removes_stale_frames() {
        let dir = TempDir::new().unwrap();
        write_frame(dir.path(), 3, &jpeg(b"stale"));
        std::fs::write(dir.path().join("keep.mp4"), b"x").unwrap();

        let directory = FrameDirectory::new(dir.path(), 5);
        directory.prepare().await.unwrap();

        assert!(directory.list_frames().await.unwrap().is_empty());
        assert!(dir.path().join("keep.mp4").exists());
    }

    #[tokio::test]
    async fn test_tick_with_watcher_wakes_on_new_file() {
        let dir = TempDir::new().unwrap();
        let buffer = FrameBuffer::new(8);
        let mut poller = FramePoller::new(
            FrameDirectory::new(dir.path(), 5),
            buffer,
            Duration::from_secs(3600),
            true,
        )
        .await
        .unwrap();

        // First tick of a tokio interval completes immediately.
        poller.tick().await;

        write_frame(dir.path(), 1, &jpeg(b"one"));
        tokio::time::timeout(Duration::from_secs(5), poller.tick())
            .await
            .expect("watcher should wake the poller");
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::NewFrame(_)));
    }
}
