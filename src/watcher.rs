use std::path::Path;
use notify::event::{AccessKind, AccessMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::errors::Result;

/// Keeps a filesystem watcher on the frame directory alive. Dropping it stops
/// the wake-up notifications.
pub struct FrameWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch `dir` and send a wake-up whenever ffmpeg creates or finishes writing
/// a file there. Wake-ups coalesce: at most one is pending at a time.
pub fn watch_frame_directory(dir: &Path) -> Result<(FrameWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_frame_write(&event.kind) {
                    // Full channel means a wake-up is already pending.
                    let _ = tx.try_send(());
                }
            }
            Err(e) => error!("Frame directory watcher error: {}", e),
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!("Watching frame directory '{}' for new frames", dir.display());

    Ok((FrameWatcher { _watcher: watcher }, rx))
}

fn is_frame_write(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        other => {
            debug!("Ignoring frame directory event {:?}", other);
            false
        }
    }
}
