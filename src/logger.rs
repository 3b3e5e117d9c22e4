use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Инициализация tracing; RUST_LOG имеет приоритет над значением по умолчанию
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_FILTER));
    // повторная инициализация (например, в тестах) не считается ошибкой
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Строка чата: либо системный текст, либо сообщение с автором
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatLine {
    Message { username: String, msg: String },
    Text(String),
}

/// Файл, полностью принятый и сохранённый на диск
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReady {
    pub name: String,
    pub ext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Событие для UI: `{"kind": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum UiEvent {
    Status(String),
    Chat(ChatLine),
    File(FileReady),
}

pub type EventSink = mpsc::UnboundedSender<UiEvent>;

fn emit(sink: &EventSink, event: UiEvent) {
    debug!(?event, "emit ui event");
    if sink.send(event).is_err() {
        warn!("UI event receiver dropped, event discarded");
    }
}

pub fn emit_status(sink: &EventSink, text: impl Into<String>) {
    emit(sink, UiEvent::Status(text.into()));
}

pub fn emit_chat_text(sink: &EventSink, text: impl Into<String>) {
    emit(sink, UiEvent::Chat(ChatLine::Text(text.into())));
}

pub fn emit_chat(sink: &EventSink, username: impl Into<String>, msg: impl Into<String>) {
    emit(
        sink,
        UiEvent::Chat(ChatLine::Message {
            username: username.into(),
            msg: msg.into(),
        }),
    );
}

pub fn emit_file(sink: &EventSink, file: FileReady) {
    emit(sink, UiEvent::File(file));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_use_kind_data_envelope() {
        let status = serde_json::to_value(UiEvent::Status("Peer is ready.".into())).unwrap();
        assert_eq!(status, json!({"kind": "status", "data": "Peer is ready."}));

        let chat = serde_json::to_value(UiEvent::Chat(ChatLine::Message {
            username: "bob".into(),
            msg: "hi".into(),
        }))
        .unwrap();
        assert_eq!(
            chat,
            json!({"kind": "chat", "data": {"username": "bob", "msg": "hi"}})
        );

        let file = serde_json::to_value(UiEvent::File(FileReady {
            name: "a.png".into(),
            ext: ".png".into(),
            path: None,
        }))
        .unwrap();
        assert_eq!(
            file,
            json!({"kind": "file", "data": {"name": "a.png", "ext": ".png"}})
        );
    }

    #[test]
    fn emit_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        emit_status(&tx, "nobody listens");
    }
}
