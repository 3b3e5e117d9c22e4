// Конфигурация приложения
// Логирование по умолчанию подробнее в режиме разработки

use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене только предупреждения

/// Фильтр tracing, если RUST_LOG не задан
pub const DEFAULT_LOG_FILTER: &str = if LOGGING_ENABLED { "info" } else { "warn" };

/// Адрес сигнального сервера по умолчанию
pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8080";

/// Все участники попадают в одну комнату
pub const FIXED_ROOM: &str = "one";

/// Размер куска файла в байтах (последний может быть короче)
pub const CHUNK_SIZE: usize = 64_000;

pub const RECEIVED_FILES_DIR: &str = "received_files";

/// Верхняя граница случайной задержки перед offer (защита от glare)
pub const OFFER_JITTER: Duration = Duration::from_millis(500);

pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Минимальное время для оценки скорости приёма
pub const SPEED_EPSILON_SECS: f64 = 0.001;

/// Метка data channel
pub const CHANNEL_LABEL: &str = "chat";

/// STUN серверы по умолчанию
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            host: env::var("RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_RELAY_PORT),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_RELAY_PORT,
        }
    }
}

/// Настройки одной сессии участника
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signal_url: String,
    pub room: String,
    pub received_dir: PathBuf,
    pub chunk_size: usize,
    pub offer_jitter: Duration,
    pub ice_servers: Vec<ServerConfig>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            signal_url: env::var("SIGNAL_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.signal_url),
            room: env::var("CHAT_ROOM")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.room),
            received_dir: env::var("RECEIVED_FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.received_dir),
            chunk_size: env::var("CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.chunk_size),
            offer_jitter: defaults.offer_jitter,
            ice_servers: defaults.ice_servers,
        }
    }

    pub fn with_signal_url(mut self, url: impl Into<String>) -> Self {
        self.signal_url = url.into();
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_received_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.received_dir = dir.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_offer_jitter(mut self, jitter: Duration) -> Self {
        self.offer_jitter = jitter;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signal_url: DEFAULT_SIGNAL_URL.to_string(),
            room: FIXED_ROOM.to_string(),
            received_dir: PathBuf::from(RECEIVED_FILES_DIR),
            chunk_size: CHUNK_SIZE,
            offer_jitter: OFFER_JITTER,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
        }
    }
}
