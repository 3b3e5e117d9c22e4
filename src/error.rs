use std::path::PathBuf;
use thiserror::Error;

/// Ошибки соединения с сигнальным сервером
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("malformed relay frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("relay socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("not connected to the relay")]
    NotConnected,
}

/// Ошибки транспортного адаптера (offer/answer, data channel)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("channel send failed: {0}")]
    Send(String),
    #[error("channel is closed")]
    ChannelClosed,
    #[error("transport is closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        TransportError::Setup(err.to_string())
    }
}

/// Ошибки разбора кадров data channel
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
}

/// Ошибки файловых операций при передаче
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file {} is empty", .0.display())]
    Empty(PathBuf),
    #[error("{filename}: a file chunk frame cannot fit into {limit} bytes")]
    FrameLimit { filename: String, limit: usize },
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Ошибка шага внутри цикла сессии
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
