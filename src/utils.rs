use crate::peer::types::ServerConfig;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Имя пользователя по умолчанию: `User-` и 4 hex-символа
pub fn default_username() -> String {
    format!("User-{}", hex::encode(rand::rng().random::<[u8; 2]>()))
}

/// Текущее время в секундах от эпохи Unix
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Последний компонент пути; `None`, если имени нет (`..`, `/`, пустая строка)
pub fn safe_file_name(name: &str) -> Option<String> {
    let normalized = name.replace('\\', "/");
    std::path::Path::new(&normalized)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.trim().is_empty())
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
