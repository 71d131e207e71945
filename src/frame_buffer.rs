use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub data: Bytes,
}

/// Holds the most recent JPEG frame and fans new frames out to subscribers.
#[derive(Clone)]
pub struct FrameBuffer {
    latest: Arc<RwLock<Option<Frame>>>,
    sender: Arc<broadcast::Sender<Frame>>,
    next_sequence: Arc<AtomicU64>,
}

impl FrameBuffer {
    pub fn new(channel_buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_buffer_size.max(1));
        Self {
            latest: Arc::new(RwLock::new(None)),
            sender: Arc::new(sender),
            next_sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn publish(&self, data: Bytes) -> Frame {
        let frame = Frame {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            captured_at: Utc::now(),
            data,
        };

        {
            let mut latest = self.latest.write().await;
            *latest = Some(frame.clone());
        }

        if self.sender.send(frame.clone()).is_err() {
            trace!("No subscribers for frame {}", frame.sequence);
        }
        frame
    }

    pub async fn latest(&self) -> Option<Frame> {
        self.latest.read().await.clone()
    }

    pub async fn clear(&self) {
        *self.latest.write().await = None;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
