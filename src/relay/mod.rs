//! Сигнальный сервер: комнаты и пересылка кадров.
//!
//! Сервер понимает только `join`; всё остальное пересылается как есть
//! другим участникам той же комнаты. Кадр отправителю не возвращается,
//! кадры для ещё не вошедших участников не буферизуются.

pub mod rooms;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use rooms::RoomRegistry;

/// Минимальный разбор входящего кадра: тип и комната
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    room: Option<String>,
}

pub fn router(rooms: RoomRegistry) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .with_state(rooms)
}

/// Запуск сервера на уже привязанном слушателе
pub async fn serve(listener: TcpListener, rooms: RoomRegistry) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("relay listening on {}", addr);
    }
    axum::serve(listener, router(rooms)).await
}

async fn websocket_handler(ws: WebSocketUpgrade, State(rooms): State<RoomRegistry>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, rooms))
}

async fn handle_socket(socket: WebSocket, rooms: RoomRegistry) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_id = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(conn = %writer_id, "relay writer finished");
    });

    debug!(conn = %conn_id, "relay connection opened");
    let mut room: Option<String> = None;

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(conn = %conn_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(conn = %conn_id, "relay socket error: {}", e);
                break;
            }
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn = %conn_id, "malformed frame, closing connection: {}", e);
                break;
            }
        };

        if envelope.kind == "join" {
            let Some(target) = envelope.room else {
                warn!(conn = %conn_id, "join without room, closing connection");
                break;
            };
            if let Some(previous) = room.take() {
                rooms.remove(&previous, &conn_id);
            }
            rooms.add(&target, conn_id.clone(), tx.clone());
            info!(conn = %conn_id, room = %target, "joined room");
            room = Some(target);
            continue;
        }

        match &room {
            Some(current) => {
                let delivered = rooms.broadcast_except(current, &conn_id, &text);
                debug!(conn = %conn_id, room = %current, kind = %envelope.kind, delivered, "relayed frame");
            }
            None => debug!(conn = %conn_id, kind = %envelope.kind, "frame before join dropped"),
        }
    }

    if let Some(current) = room {
        rooms.remove(&current, &conn_id);
        info!(conn = %conn_id, room = %current, "left room");
    }
    drop(tx);
    writer.abort();
}
