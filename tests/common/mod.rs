#![allow(dead_code)]

use pairchat_lib::relay::{self, RoomRegistry};
use pairchat_lib::{ChatLine, UiEvent};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const STEP: Duration = Duration::from_secs(5);

/// Сервер на свободном порту; возвращает ws url и реестр комнат
pub async fn start_relay() -> (String, RoomRegistry) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let rooms = RoomRegistry::new();
    tokio::spawn(relay::serve(listener, rooms.clone()));
    (format!("ws://{addr}"), rooms)
}

/// join обрабатывается асинхронно, ждём пока сервер его увидит
pub async fn wait_members(rooms: &RoomRegistry, room: &str, count: usize) {
    timeout(STEP, async {
        while rooms.member_count(room) != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room {room} never reached {count} members"));
}

/// Журнал UI событий одной сессии
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<UiEvent>,
    pub seen: Vec<UiEvent>,
}

impl EventLog {
    pub fn new(rx: mpsc::UnboundedReceiver<UiEvent>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Первое подходящее событие; все прочитанные события остаются в `seen`
    pub async fn wait_for(&mut self, what: &str, pred: impl Fn(&UiEvent) -> bool) -> UiEvent {
        loop {
            let event = timeout(STEP, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {what}; seen: {:#?}", self.seen))
                .unwrap_or_else(|| panic!("session ended before {what}; seen: {:#?}", self.seen));
            self.seen.push(event.clone());
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn wait_status(&mut self, text: &str) -> UiEvent {
        self.wait_for(text, |e| matches!(e, UiEvent::Status(s) if s == text))
            .await
    }

    pub async fn wait_status_prefix(&mut self, prefix: &str) -> String {
        match self
            .wait_for(prefix, |e| matches!(e, UiEvent::Status(s) if s.starts_with(prefix)))
            .await
        {
            UiEvent::Status(s) => s,
            _ => unreachable!(),
        }
    }

    /// Дочитываем до конца сессии
    pub async fn drain(&mut self) {
        loop {
            match timeout(STEP, self.rx.recv()).await {
                Ok(Some(event)) => self.seen.push(event),
                Ok(None) => return,
                Err(_) => panic!("session did not finish; seen: {:#?}", self.seen),
            }
        }
    }

    pub fn count_status(&self, text: &str) -> usize {
        self.seen
            .iter()
            .filter(|e| matches!(e, UiEvent::Status(s) if s == text))
            .count()
    }

    pub fn count_chat_text(&self, text: &str) -> usize {
        self.seen
            .iter()
            .filter(|e| matches!(e, UiEvent::Chat(ChatLine::Text(t)) if t == text))
            .count()
    }

    /// Сообщения чата с автором, по порядку
    pub fn chat_messages(&self) -> Vec<(String, String)> {
        self.seen
            .iter()
            .filter_map(|e| match e {
                UiEvent::Chat(ChatLine::Message { username, msg }) => {
                    Some((username.clone(), msg.clone()))
                }
                _ => None,
            })
            .collect()
    }
}
