use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("FFmpeg binary '{binary}' not found")]
    FfmpegNotFound { binary: String },

    #[error("FFmpeg error: {message}")]
    Ffmpeg { message: String },

    #[error("RTSP connection failed: {message}")]
    Connection { message: String },

    #[error("Stream is not active")]
    NotStreaming,

    #[error("Recording already in progress: {path}")]
    AlreadyRecording { path: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("File watcher error: {source}")]
    Watch {
        #[from]
        source: notify::Error,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn ffmpeg(message: impl Into<String>) -> Self {
        Self::Ffmpeg { message: message.into() }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
