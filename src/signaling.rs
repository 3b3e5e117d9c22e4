//! Клиент сигнального сервера: JSON-кадры `join`/`ready`/`offer`/`answer`
//! поверх websocket.

use crate::error::SignalingError;
use crate::peer::types::SessionDescription;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Кадр сигнального протокола
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Join {
        room: String,
    },
    Ready {
        room: String,
    },
    Offer {
        room: String,
        data: SessionDescription,
    },
    Answer {
        room: String,
        data: SessionDescription,
    },
    /// Незнакомый тип кадра, пропускается
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn encode(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Что читающая задача сообщает владельцу соединения
#[derive(Debug)]
pub enum RelayEvent {
    Message(SignalMessage),
    Failed(SignalingError),
    Closed,
}

pub type RelayEventHandler = Box<dyn Fn(RelayEvent) + Send + Sync>;

/// Соединение с сигнальным сервером в одной комнате.
/// Запись идёт через `send`, чтение — в отдельной задаче, которая
/// отдаёт кадры в `handler` и завершается первым `Failed`/`Closed`.
pub struct RelayConnection {
    room: String,
    writer: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
}

impl RelayConnection {
    /// Подключается и сразу отправляет `join{room}`
    pub async fn connect(
        url: &str,
        room: &str,
        handler: RelayEventHandler,
    ) -> Result<Self, SignalingError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|source| SignalingError::Connect {
                url: url.to_string(),
                source,
            })?;
        let (writer, reader) = stream.split();
        let reader = tokio::spawn(read_loop(reader, handler));

        let mut conn = Self {
            room: room.to_string(),
            writer,
            reader,
        };
        let join = SignalMessage::Join {
            room: room.to_string(),
        };
        conn.send(&join).await?;
        info!(%url, room = %conn.room, "joined relay room");
        Ok(conn)
    }

    pub async fn send(&mut self, msg: &SignalMessage) -> Result<(), SignalingError> {
        let text = msg.encode()?;
        debug!(room = %self.room, frame = %text, "relay send");
        self.writer.send(Message::Text(text)).await?;
        Ok(())
    }

    pub async fn ready(&mut self) -> Result<(), SignalingError> {
        let room = self.room.clone();
        self.send(&SignalMessage::Ready { room }).await
    }

    pub async fn offer(&mut self, data: SessionDescription) -> Result<(), SignalingError> {
        let room = self.room.clone();
        self.send(&SignalMessage::Offer { room, data }).await
    }

    pub async fn answer(&mut self, data: SessionDescription) -> Result<(), SignalingError> {
        let room = self.room.clone();
        self.send(&SignalMessage::Answer { room, data }).await
    }

    /// Закрываем соединение; читающая задача останавливается без `Closed`
    pub async fn close(mut self) {
        self.reader.abort();
        if let Err(e) = self.writer.send(Message::Close(None)).await {
            debug!("relay close frame not sent: {}", e);
        }
        let _ = self.writer.close().await;
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut reader: SplitStream<WsStream>, handler: RelayEventHandler) {
    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(e) => {
                    handler(RelayEvent::Failed(SignalingError::Malformed(
                        serde::de::Error::custom(e),
                    )));
                    return;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("relay read failed: {}", e);
                handler(RelayEvent::Failed(SignalingError::Socket(e)));
                return;
            }
        };

        match SignalMessage::decode(&text) {
            Ok(SignalMessage::Unknown) => debug!(frame = %text, "ignoring unknown relay frame"),
            Ok(msg) => handler(RelayEvent::Message(msg)),
            Err(e) => {
                warn!(frame = %text, "malformed relay frame: {}", e);
                handler(RelayEvent::Failed(e));
                return;
            }
        }
    }
    debug!("relay connection closed by server");
    handler(RelayEvent::Closed);
}
