use std::collections::HashMap;
use std::time::Duration;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures_util::{stream::StreamExt, SinkExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::frame_buffer::Frame;
use crate::AppState;

const SEND_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Raw JPEG bytes in a binary message.
    Binary,
    /// `{"event":"video_frame","image":"<base64>"}` text message.
    Json,
}

impl FrameFormat {
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        match query.get("format").map(|s| s.as_str()) {
            Some("json") | Some("base64") => FrameFormat::Json,
            _ => FrameFormat::Binary,
        }
    }
}

#[derive(Serialize)]
struct VideoFrameEvent<'a> {
    event: &'a str,
    sequence: u64,
    timestamp: chrono::DateTime<chrono::Utc>,
    image: String,
}

pub fn encode_frame(frame: &Frame, format: FrameFormat) -> Message {
    match format {
        FrameFormat::Binary => Message::Binary(frame.data.to_vec()),
        FrameFormat::Json => {
            let event = VideoFrameEvent {
                event: "video_frame",
                sequence: frame.sequence,
                timestamp: frame.captured_at,
                image: base64::engine::general_purpose::STANDARD.encode(&frame.data),
            };
            // Serializing a struct of strings and numbers cannot fail.
            Message::Text(serde_json::to_string(&event).unwrap_or_default())
        }
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let format = FrameFormat::from_query(&query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, format))
}

async fn handle_socket(socket: WebSocket, state: AppState, format: FrameFormat) {
    let client_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let mut frame_receiver = state.frames.subscribe();
    let initial = state.frames.latest().await;
    let shutdown = state.shutdown_requested();

    info!("Client {} connected ({:?} frames)", client_id, format);
    debug!("Frame buffer has {} subscribers", state.frames.subscriber_count());

    let mut send_task = tokio::spawn(async move {
        let mut sent = 0u64;
        let mut dropped = 0u64;

        if let Some(frame) = initial {
            if sender.send(encode_frame(&frame, format)).await.is_err() {
                return;
            }
            sent += 1;
        }

        tokio::pin!(shutdown);
        loop {
            let received = tokio::select! {
                _ = &mut shutdown => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                received = frame_receiver.recv() => received,
            };
            match received {
                Ok(frame) => {
                    // Slow clients lose frames instead of building a backlog.
                    match tokio::time::timeout(SEND_TIMEOUT, sender.send(encode_frame(&frame, format))).await {
                        Ok(Ok(())) => sent += 1,
                        Ok(Err(_)) => {
                            debug!("Client {} send failed", client_id);
                            break;
                        }
                        Err(_) => {
                            dropped += 1;
                            if dropped % 10 == 0 {
                                debug!("Client {} dropped {} frames (slow connection)", client_id, dropped);
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    dropped += skipped;
                    debug!("Client {} lagged, skipped {} frames", client_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Client {} send task ended (sent: {}, dropped: {})", client_id, sent, dropped);
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => debug!("Client {} sent: {}", client_id, text),
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    error!("WebSocket error from client {}: {}", client_id, e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("Client {} disconnected", client_id);
}
