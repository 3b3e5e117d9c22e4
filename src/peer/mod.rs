//! Транспортный адаптер: соединение точка-точка и data channel.
//!
//! Сессия работает только через `TransportAdapter` и `DataChannel`;
//! реализация на webrtc живёт в `connection`/`data_channel`, а `loopback`
//! соединяет два адаптера внутри процесса.

pub mod connection;
pub mod data_channel;
pub mod loopback;
pub mod types;

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub use connection::WebRtcTransport;
pub use data_channel::WebRtcChannel;
pub use loopback::{LoopbackChannel, LoopbackNetwork, LoopbackTransport};
pub use types::{SdpKind, ServerConfig, SessionDescription};

/// События уровня канала
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Message(Bytes),
}

pub type ChannelEventHandler = Box<dyn Fn(ChannelEvent) + Send + Sync>;
pub type IncomingChannelHandler = Box<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>;

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    /// Подписка на open/close/message; повторный вызов заменяет обработчик
    fn on_event(&self, handler: ChannelEventHandler);

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Применяет локальное описание и возвращает его в итоговом виде
    /// (для webrtc: после сбора ICE кандидатов)
    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Канал, открытый удалённой стороной
    fn on_incoming_channel(&self, handler: IncomingChannelHandler);

    /// Предел длины одного сообщения в канале, None если его нет
    fn max_message_size(&self) -> Option<usize> {
        None
    }

    async fn close(&self) -> Result<(), TransportError>;
}
