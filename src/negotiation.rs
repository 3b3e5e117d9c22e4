//! Готовность сторон и гонка за право отправить offer.
//!
//! Оба пира получают `ready` друг от друга, поэтому оба захотят отправить
//! offer. Каждый ждёт случайную задержку из [0, jitter) и перед отправкой
//! перепроверяет флаги: кто увидел чужой offer раньше, тот отступает.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct Negotiation {
    pub local_ready: bool,
    pub peer_ready: bool,
    pub offer_sent: bool,
    pub offer_received: bool,
    ready_announced: bool,
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Отмечаем локальную готовность; true, если `ready` ещё не отправляли
    pub fn mark_local_ready(&mut self) -> bool {
        self.local_ready = true;
        !self.ready_announced
    }

    pub fn mark_ready_announced(&mut self) {
        self.ready_announced = true;
    }

    /// Новое соединение с сервером: `ready` нужно объявить заново
    pub fn reset_announcement(&mut self) {
        self.ready_announced = false;
    }

    /// Пир готов; true, если пора запускать гонку за offer
    pub fn mark_peer_ready(&mut self) -> bool {
        self.peer_ready = true;
        self.should_race()
    }

    pub fn should_race(&self) -> bool {
        self.local_ready && self.peer_ready && !(self.offer_sent || self.offer_received)
    }

    /// Сработал таймер: забираем право на offer, если его никто не занял
    pub fn claim_offer(&mut self) -> bool {
        if self.offer_received || self.offer_sent {
            return false;
        }
        self.offer_sent = true;
        true
    }

    pub fn mark_offer_received(&mut self) {
        self.offer_received = true;
    }
}

/// Случайная задержка из [0, jitter)
pub fn offer_delay(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    let secs = rand::rng().random_range(0.0..jitter.as_secs_f64());
    Duration::from_secs_f64(secs)
}
