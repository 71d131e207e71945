use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::errors::StreamError;
use crate::recorder;
use crate::streamer::{RtspStreamer, StatusSnapshot};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(message: &str, data: Option<T>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            data,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            data: None,
        }
    }
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ApiResponse::error(message))).into_response()
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub stream: StatusSnapshot,
    /// A start/stop request is in progress and holds the streamer.
    pub busy: bool,
    pub viewers: usize,
}

pub async fn start_stream(State(state): State<AppState>) -> Response {
    let mut current = state.streamer.lock().await;

    if let Some(mut previous) = current.take() {
        info!("Restarting stream");
        if let Err(e) = previous.stop_streaming().await {
            warn!("Failed to stop previous stream cleanly: {}", e);
        }
    }

    let mut streamer = match RtspStreamer::new(state.config.clone(), state.frames.clone()) {
        Ok(streamer) => streamer,
        Err(e) => {
            error!("Invalid camera configuration: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    match streamer.start_streaming().await {
        Ok(()) => {
            *current = Some(streamer);
            Json(ApiResponse::<()>::success("Stream started successfully", None)).into_response()
        }
        Err(e @ StreamError::FfmpegNotFound { .. }) => {
            error!("Failed to start stream: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!("Failed to start stream: {}", e);
            error_response(
                StatusCode::BAD_GATEWAY,
                format!("Failed to start stream. Check camera connection and credentials. ({})", e),
            )
        }
    }
}

pub async fn stop_stream(State(state): State<AppState>) -> Response {
    let mut current = state.streamer.lock().await;
    if let Some(mut streamer) = current.take() {
        if let Err(e) = streamer.stop_streaming().await {
            warn!("Error while stopping stream: {}", e);
        }
    }
    Json(ApiResponse::<()>::success("Stream stopped", None)).into_response()
}

pub async fn start_recording(State(state): State<AppState>) -> Response {
    let current = state.streamer.lock().await;
    let Some(streamer) = current.as_ref() else {
        return error_response(
            StatusCode::CONFLICT,
            "Failed to start recording. Make sure stream is active.",
        );
    };

    match streamer.start_recording().await {
        Ok(path) => Json(ApiResponse::success(
            "Recording started",
            Some(serde_json::json!({ "file": path })),
        ))
        .into_response(),
        Err(StreamError::NotStreaming) => error_response(
            StatusCode::CONFLICT,
            "Failed to start recording. Make sure stream is active.",
        ),
        Err(e @ StreamError::AlreadyRecording { .. }) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => {
            error!("Failed to start recording: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn stop_recording(State(state): State<AppState>) -> Response {
    let current = state.streamer.lock().await;
    let summary = match current.as_ref() {
        Some(streamer) => match streamer.stop_recording().await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Failed to stop recording: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        },
        None => None,
    };
    Json(ApiResponse::success("Recording stopped", summary)).into_response()
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let viewers = state.frames.subscriber_count();
    let response = match state.streamer.try_lock() {
        Ok(current) => {
            let stream = match current.as_ref() {
                Some(streamer) => streamer.status().await,
                None => StatusSnapshot::default(),
            };
            StatusResponse { stream, busy: false, viewers }
        }
        Err(_) => StatusResponse {
            stream: StatusSnapshot::default(),
            busy: true,
            viewers,
        },
    };
    Json(response)
}

pub async fn list_recordings(State(state): State<AppState>) -> Response {
    match recorder::list_recordings(&state.config.recording.output_directory).await {
        Ok(files) => Json(ApiResponse::success("Recordings listed", Some(files))).into_response(),
        Err(e) => {
            error!("Failed to list recordings: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::{build_router, AppState};
    use super::*;

    fn test_state(dir: &TempDir) -> AppState {
        let mut config = Config::default();
        config.ffmpeg.binary = "/nonexistent/ffmpeg".to_string();
        config.streaming.frame_directory = dir.path().join("frames");
        config.streaming.reconnect_attempts = 1;
        config.streaming.reconnect_delay = Duration::from_millis(1);
        config.streaming.watch_events = false;
        config.recording.output_directory = dir.path().join("recordings");
        AppState::new(Arc::new(config))
    }

    async fn send(state: &AppState, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = build_router(state.clone())
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_without_stream() {
        let dir = TempDir::new().unwrap();
        let (code, body) = send(&test_state(&dir), "GET", "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["streaming"], false);
        assert_eq!(body["recording"], false);
        assert_eq!(body["connected"], false);
        assert_eq!(body["busy"], false);
    }

    #[tokio::test]
    async fn test_start_stream_without_ffmpeg_reports_error() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let (code, body) = send(&state, "POST", "/start_stream").await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(state.streamer.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_recording_requires_stream() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let (code, body) = send(&state, "POST", "/start_recording").await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["message"], "Failed to start recording. Make sure stream is active.");

        let (code, body) = send(&state, "POST", "/stop_recording").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "success");
    }

    #[tokio::test]
    async fn test_stop_stream_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        for _ in 0..2 {
            let (code, body) = send(&state, "POST", "/stop_stream").await;
            assert_eq!(code, StatusCode::OK);
            assert_eq!(body["message"], "Stream stopped");
        }
    }

    #[tokio::test]
    async fn test_list_recordings() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let (_, body) = send(&state, "GET", "/recordings").await;
        assert_eq!(body["data"], serde_json::json!([]));

        std::fs::create_dir_all(dir.path().join("recordings")).unwrap();
        std::fs::write(dir.path().join("recordings/recording_20240101_000000.mp4"), b"abc").unwrap();
        let (_, body) = send(&state, "GET", "/recordings").await;
        assert_eq!(body["data"][0]["file_name"], "recording_20240101_000000.mp4");
        assert_eq!(body["data"][0]["size_bytes"], 3);
    }

    #[tokio::test]
    async fn test_snapshot_and_get_only_routes() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let response = build_router(state.clone())
            .oneshot(Request::builder().uri("/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        state.frames.publish(bytes::Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9])).await;
        let response = build_router(state.clone())
            .oneshot(Request::builder().uri("/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/jpeg");

        let response = build_router(state)
            .oneshot(Request::builder().uri("/start_stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_and_recording_lifecycle() {
        use crate::test_support::{fake_config, write_fake_ffmpeg, Preview};

        let dir = TempDir::new().unwrap();
        let ffmpeg = write_fake_ffmpeg(dir.path(), Preview::Continuous);
        let state = AppState::new(fake_config(dir.path(), &ffmpeg));

        let (code, body) = send(&state, "POST", "/start_stream").await;
        assert_eq!(code, StatusCode::OK, "{}", body);
        assert_eq!(body["message"], "Stream started successfully");

        let (_, body) = send(&state, "GET", "/status").await;
        assert_eq!(body["streaming"], true);
        assert_eq!(body["connected"], true);

        let (code, body) = send(&state, "POST", "/start_recording").await;
        assert_eq!(code, StatusCode::OK, "{}", body);
        let file = body["data"]["file"].as_str().unwrap().to_string();

        let (code, _) = send(&state, "POST", "/start_recording").await;
        assert_eq!(code, StatusCode::CONFLICT);

        let (_, body) = send(&state, "GET", "/status").await;
        assert_eq!(body["recording"], true);
        assert_eq!(body["recording_file"], file.as_str());

        let (code, body) = send(&state, "POST", "/stop_recording").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["data"]["path"], file.as_str());
        assert!(std::fs::read_to_string(&file).unwrap().contains("got=q"));

        let (code, _) = send(&state, "POST", "/stop_stream").await;
        assert_eq!(code, StatusCode::OK);
        let (_, body) = send(&state, "GET", "/status").await;
        assert_eq!(body["streaming"], false);
        assert!(state.frames.latest().await.is_none());
    }
}
