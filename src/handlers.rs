use std::convert::Infallible;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use crate::frame_buffer::Frame;
use crate::AppState;

const MJPEG_BOUNDARY: &str = "frame";

pub async fn index_handler() -> Html<&'static str> {
    trace!("Index page requested");
    Html(include_str!("../static/index.html"))
}

/// One part of a `multipart/x-mixed-replace` MJPEG response.
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// MJPEG stream for plain `<img src="/video_feed">` viewers.
pub async fn video_feed_handler(State(state): State<AppState>) -> Response {
    debug!("MJPEG viewer connected");
    let initial: Vec<Frame> = state.frames.latest().await.into_iter().collect();
    let updates = BroadcastStream::new(state.frames.subscribe())
        // Lagged viewers just skip to the next frame.
        .filter_map(|res| async move { res.ok() });

    let body = stream::iter(initial)
        .chain(updates)
        .take_until(state.shutdown_requested())
        .map(|frame| Ok::<_, Infallible>(mjpeg_part(&frame.data)));

    Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// The latest frame as a single JPEG.
pub async fn snapshot_handler(State(state): State<AppState>) -> Response {
    match state.frames.latest().await {
        Some(frame) => (
            [
                (header::CONTENT_TYPE, "image/jpeg".to_string()),
                (header::CACHE_CONTROL, "no-cache".to_string()),
                (header::LAST_MODIFIED, frame.captured_at.to_rfc2822()),
            ],
            frame.data,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "No frame available").into_response(),
    }
}
