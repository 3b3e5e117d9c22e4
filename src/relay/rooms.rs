use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub type ConnId = String;

/// Очередь исходящих кадров одного участника
pub type MemberTx = mpsc::UnboundedSender<String>;

/// Реестр комнат: room -> (conn_id -> очередь участника).
/// Комната появляется с первым участником и удаляется вместе с последним.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, HashMap<ConnId, MemberTx>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, room: &str, conn_id: ConnId, tx: MemberTx) {
        let mut members = self.rooms.entry(room.to_string()).or_default();
        members.insert(conn_id, tx);
        debug!(%room, members = members.len(), "member added");
    }

    pub fn remove(&self, room: &str, conn_id: &str) {
        let mut remove_room = false;
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(conn_id);
            remove_room = members.is_empty();
        }
        // guard отпущен, можно удалять саму комнату
        if remove_room {
            self.rooms.remove_if(room, |_, members| members.is_empty());
            debug!(%room, "room removed");
        }
    }

    /// Рассылает кадр всем участникам комнаты, кроме отправителя.
    /// Возвращает число участников, которым кадр поставлен в очередь.
    pub fn broadcast_except(&self, room: &str, sender: &str, frame: &str) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        let mut delivered = 0;
        for (conn_id, tx) in members.iter() {
            if conn_id == sender {
                continue;
            }
            if tx.send(frame.to_string()).is_ok() {
                delivered += 1;
            } else {
                debug!(%room, %conn_id, "member queue closed, frame dropped");
            }
        }
        delivered
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
