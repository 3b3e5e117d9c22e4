//! Координатор сессии: одна задача владеет всем изменяемым состоянием.
//!
//! Внешние вызовы (`click_ready`, `send_message`, ...) только кладут команду
//! в очередь. Чтение сигнального сервера, таймер гонки за offer и события
//! data channel приходят в тот же цикл через `Input`.

use crate::config::{ClientConfig, CHANNEL_LABEL};
use crate::error::{SessionError, SignalingError, TransferError, TransportError};
use crate::logger::{emit_chat, emit_chat_text, emit_file, emit_status, EventSink, UiEvent};
use crate::negotiation::{offer_delay, Negotiation};
use crate::peer::{
    ChannelEvent, DataChannel, SessionDescription, TransportAdapter, WebRtcTransport,
};
use crate::protocol::{FileChunk, Frame, SystemSignal};
use crate::signaling::{RelayConnection, RelayEvent, RelayEventHandler, SignalMessage};
use crate::transfer::{prepare_outbound, Reassembler};
use crate::utils::{default_username, unix_now};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Фаза сессии
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// подключение к сигнальному серверу, `ready` ещё не отправлен
    Signaling,
    /// `ready` отправлен, ждём пира
    WaitingPeer,
    Negotiating,
    Open,
    Closed,
    Error,
}

#[derive(Debug)]
enum Command {
    SetUsername(String),
    ClickReady,
    SendMessage(String),
    SendFile(PathBuf),
    Disconnect,
}

enum Input {
    Relay { generation: u64, event: RelayEvent },
    OfferTimer,
    IncomingChannel(Arc<dyn DataChannel>),
    Channel(ChannelEvent),
}

/// Ручка для управления сессией из любого потока
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<Phase>,
}

impl SessionHandle {
    /// Запускает сессию поверх готового транспорта; возвращает ручку и поток UI событий
    pub fn spawn(
        config: ClientConfig,
        transport: Arc<dyn TransportAdapter>,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Signaling);

        let session = Session {
            reassembler: Reassembler::new(config.received_dir.clone()),
            config,
            username: default_username(),
            phase: Phase::Signaling,
            phase_tx,
            events: events_tx,
            inputs: inputs_tx,
            transport,
            relay: None,
            relay_generation: 0,
            negotiation: Negotiation::new(),
            channel: None,
            channel_open: false,
            pending: VecDeque::new(),
        };
        tokio::spawn(session.run(commands_rx, inputs_rx));

        (
            Self {
                commands: commands_tx,
                phase: phase_rx,
            },
            events_rx,
        )
    }

    /// Сессия поверх webrtc с ICE серверами из конфигурации
    pub async fn spawn_webrtc(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UiEvent>), TransportError> {
        let transport = WebRtcTransport::new(&config.ice_servers).await?;
        Ok(Self::spawn(config, Arc::new(transport)))
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Ждём фазу, удовлетворяющую условию; false, если сессия завершилась раньше
    pub async fn wait_for_phase(&self, pred: impl Fn(Phase) -> bool) -> bool {
        let mut rx = self.phase.clone();
        let reached = rx.wait_for(|phase| pred(*phase)).await.is_ok();
        reached
    }

    pub fn set_username(&self, name: impl Into<String>) -> bool {
        self.send(Command::SetUsername(name.into()))
    }

    pub fn click_ready(&self) -> bool {
        self.send(Command::ClickReady)
    }

    pub fn send_message(&self, text: impl Into<String>) -> bool {
        self.send(Command::SendMessage(text.into()))
    }

    pub fn send_file(&self, path: impl Into<PathBuf>) -> bool {
        self.send(Command::SendFile(path.into()))
    }

    /// Не ждёт закрытия транспорта
    pub fn disconnect(&self) -> bool {
        self.send(Command::Disconnect)
    }

    fn send(&self, command: Command) -> bool {
        match self.commands.send(command) {
            Ok(()) => true,
            Err(e) => {
                debug!(command = ?e.0, "session already finished, command dropped");
                false
            }
        }
    }
}

struct Session {
    config: ClientConfig,
    username: String,
    phase: Phase,
    phase_tx: watch::Sender<Phase>,
    events: EventSink,
    inputs: mpsc::UnboundedSender<Input>,
    transport: Arc<dyn TransportAdapter>,
    relay: Option<RelayConnection>,
    relay_generation: u64,
    negotiation: Negotiation,
    channel: Option<Arc<dyn DataChannel>>,
    channel_open: bool,
    pending: VecDeque<String>,
    reassembler: Reassembler,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        self.connect_relay().await;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    // все ручки отброшены: закрываемся как при disconnect
                    let command = command.unwrap_or(Command::Disconnect);
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(input) = inputs.recv() => self.handle_input(input).await,
            }
        }
        debug!("session loop finished");
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "session phase changed");
            self.phase = phase;
            self.phase_tx.send_replace(phase);
        }
    }

    fn status(&self, text: impl Into<String>) {
        emit_status(&self.events, text);
    }

    /// false, когда цикл пора завершать
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SetUsername(name) => self.set_username(name),
            Command::ClickReady => self.click_ready().await,
            Command::SendMessage(text) => self.send_message(text).await,
            Command::SendFile(path) => self.send_file(path).await,
            Command::Disconnect => {
                self.disconnect().await;
                return false;
            }
        }
        true
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Relay { generation, event } => {
                if generation != self.relay_generation || self.relay.is_none() {
                    debug!(generation, "stale relay event ignored");
                    return;
                }
                self.handle_relay(event).await;
            }
            Input::OfferTimer => self.try_send_offer().await,
            Input::IncomingChannel(channel) => {
                info!(label = %channel.label(), "incoming data channel");
                if self.channel.is_some() {
                    warn!("replacing existing data channel");
                }
                self.channel = Some(channel);
            }
            Input::Channel(event) => self.handle_channel(event).await,
        }
    }

    // ---- сигнальный сервер ----

    async fn connect_relay(&mut self) {
        self.set_phase(Phase::Signaling);
        self.status(format!(
            "Connecting to signalling server – room '{}'…",
            self.config.room
        ));

        self.relay_generation += 1;
        let generation = self.relay_generation;
        let inputs = self.inputs.clone();
        let handler: RelayEventHandler = Box::new(move |event| {
            let _ = inputs.send(Input::Relay { generation, event });
        });

        match RelayConnection::connect(&self.config.signal_url, &self.config.room, handler).await {
            Ok(relay) => {
                self.relay = Some(relay);
                self.negotiation.reset_announcement();
                self.status(format!("Joined room '{}'", self.config.room));
                if self.negotiation.local_ready {
                    self.announce_ready().await;
                }
            }
            Err(e) => self.signaling_failed(Some(e)),
        }
    }

    async fn announce_ready(&mut self) {
        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        match relay.ready().await {
            Ok(()) => {
                self.negotiation.mark_ready_announced();
                info!(room = %self.config.room, "ready announced");
                if self.phase == Phase::Signaling {
                    self.set_phase(Phase::WaitingPeer);
                }
            }
            Err(e) => self.signaling_failed(Some(e)),
        }
    }

    /// Обрыв или мусор от сервера: соединение сбрасывается, повтор через `click_ready`
    fn signaling_failed(&mut self, err: Option<SignalingError>) {
        if let Some(e) = &err {
            warn!("signalling failure: {}", e);
            self.status(format!("Signalling error: {}", e));
        }
        self.status("Signalling connection closed");
        self.relay = None;
        self.set_phase(Phase::Error);
    }

    async fn handle_relay(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Message(SignalMessage::Ready { .. }) => {
                self.status("Peer is ready.");
                if self.negotiation.mark_peer_ready() {
                    self.schedule_offer();
                }
            }
            RelayEvent::Message(SignalMessage::Offer { data, .. }) => {
                self.negotiation.mark_offer_received();
                self.set_phase(Phase::Negotiating);
                match self.answer_offer(data).await {
                    Ok(()) => self.status("Answer sent – awaiting channel open…"),
                    Err(e) => self.step_failed(e),
                }
            }
            RelayEvent::Message(SignalMessage::Answer { data, .. }) => {
                match self.transport.set_remote_description(data).await {
                    Ok(()) => self.status("Answer accepted – awaiting channel open…"),
                    Err(e) => self.step_failed(e.into()),
                }
            }
            RelayEvent::Message(other) => debug!(?other, "relay frame ignored"),
            RelayEvent::Failed(e) => self.signaling_failed(Some(e)),
            RelayEvent::Closed => self.signaling_failed(None),
        }
    }

    fn step_failed(&mut self, err: SessionError) {
        match err {
            SessionError::Signaling(e) => self.signaling_failed(Some(e)),
            other => {
                warn!("negotiation failed: {}", other);
                self.status(format!("Negotiation error: {}", other));
            }
        }
    }

    // ---- гонка за offer ----

    fn schedule_offer(&self) {
        let delay = offer_delay(self.config.offer_jitter);
        debug!(?delay, "offer attempt scheduled");
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(Input::OfferTimer);
        });
    }

    async fn try_send_offer(&mut self) {
        if !self.negotiation.claim_offer() {
            debug!("offer attempt skipped, negotiation already under way");
            return;
        }
        self.set_phase(Phase::Negotiating);
        match self.send_offer().await {
            Ok(()) => self.status("Offer sent – waiting for answer…"),
            Err(e) => self.step_failed(e),
        }
    }

    async fn send_offer(&mut self) -> Result<(), SessionError> {
        let channel = self.transport.create_channel(CHANNEL_LABEL).await?;
        wire_channel(&channel, &self.inputs);
        self.channel = Some(channel);

        let offer = self.transport.create_offer().await?;
        let offer = self.transport.set_local_description(offer).await?;
        let relay = self.relay.as_mut().ok_or(SignalingError::NotConnected)?;
        relay.offer(offer).await?;
        info!(room = %self.config.room, "offer sent");
        Ok(())
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), SessionError> {
        let inputs = self.inputs.clone();
        self.transport.on_incoming_channel(Box::new(move |channel| {
            // канал должен попасть в цикл раньше своих событий
            let _ = inputs.send(Input::IncomingChannel(channel.clone()));
            wire_channel(&channel, &inputs);
        }));

        self.transport.set_remote_description(offer).await?;
        let answer = self.transport.create_answer().await?;
        let answer = self.transport.set_local_description(answer).await?;
        let relay = self.relay.as_mut().ok_or(SignalingError::NotConnected)?;
        relay.answer(answer).await?;
        info!(room = %self.config.room, "answer sent");
        Ok(())
    }

    // ---- data channel ----

    async fn handle_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                if self.channel_open {
                    return;
                }
                self.channel_open = true;
                self.set_phase(Phase::Open);
                self.status("-- channel open --");
                if let Err(e) = self.on_open().await {
                    warn!("failed to flush after open: {}", e);
                    self.status(format!("Send error: {}", e));
                }
            }
            ChannelEvent::Close => {
                if !self.channel_open {
                    return;
                }
                self.channel_open = false;
                self.reassembler.abandon_all();
                self.set_phase(Phase::Closed);
                self.status("Data channel closed with peer.");
            }
            ChannelEvent::Message(raw) => match Frame::decode(&raw) {
                Ok(frame) => self.handle_frame(frame).await,
                Err(e) => {
                    debug!("bad peer frame: {}", e);
                    emit_chat(
                        &self.events,
                        "System",
                        format!("[Error processing peer message: {}]", e),
                    );
                }
            },
        }
    }

    /// Представляемся и отправляем накопленные сообщения по порядку
    async fn on_open(&mut self) -> Result<(), SessionError> {
        self.send_frame(&Frame::announce(self.username.clone())).await?;
        while let Some(text) = self.pending.pop_front() {
            let frame = Frame::chat(self.username.clone(), text);
            self.send_frame(&frame).await?;
        }
        Ok(())
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        let channel = self.channel.as_ref().ok_or(TransportError::ChannelClosed)?;
        channel.send_text(frame.encode()?).await?;
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Chat { username, msg } => emit_chat(&self.events, username, msg),
            Frame::UsernameAnnounce { username_announce } => {
                info!(peer = %username_announce, "peer announced username");
                self.status(format!("Peer's username: {}", username_announce));
            }
            Frame::System {
                system: SystemSignal::Disconnect,
            } => {
                info!("peer disconnected");
                emit_chat_text(&self.events, "----disconnected----");
                self.status("Peer disconnected");
            }
            Frame::FileChunk(chunk) => self.receive_chunk(chunk).await,
        }
    }

    async fn receive_chunk(&mut self, chunk: FileChunk) {
        debug!(filename = %chunk.filename, chunk_id = chunk.chunk_id, "file chunk received");
        let progress = self.reassembler.store(chunk, unix_now());
        self.status(progress.status_line());
        if !progress.is_complete() {
            return;
        }
        match self.reassembler.assemble(&progress.filename).await {
            Ok(file) => {
                emit_chat(
                    &self.events,
                    "Peer",
                    format!("[file] '{}' received. Download link available.", file.name),
                );
                emit_file(&self.events, file);
            }
            Err(e) => {
                warn!(filename = %progress.filename, "file assembly failed: {}", e);
                self.status(format!("Error: {}", e));
            }
        }
    }

    // ---- действия пользователя ----

    fn set_username(&mut self, name: String) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.username = name.to_string();
        self.status(format!("Username set to: {}", self.username));
    }

    async fn click_ready(&mut self) {
        let first = self.negotiation.mark_local_ready();
        self.status("You are ready – waiting for peer…");

        if self.relay.is_none() {
            if self.phase == Phase::Error {
                info!("reconnecting to signalling server");
                if !self.channel_open {
                    // прошлая попытка не довела до канала, начинаем заново
                    self.negotiation = Negotiation::new();
                    self.negotiation.mark_local_ready();
                }
                self.connect_relay().await;
            }
            return;
        }
        if first {
            self.announce_ready().await;
        }
    }

    async fn send_message(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        if !self.channel_open {
            debug!(queued = self.pending.len() + 1, "channel not open, message queued");
            self.pending.push_back(text);
            return;
        }
        let frame = Frame::chat(self.username.clone(), text);
        if let Err(e) = self.send_frame(&frame).await {
            warn!("chat send failed: {}", e);
            self.status(format!("Send error: {}", e));
        }
    }

    async fn send_file(&mut self, path: PathBuf) {
        let frame_limit = self.transport.max_message_size();
        let prepared =
            prepare_outbound(&path, self.config.chunk_size, frame_limit, unix_now()).await;
        let chunks = match prepared {
            Ok(chunks) => chunks,
            Err(TransferError::NotFound(_)) => {
                self.status(format!("Error: File not found for sending: {}", path.display()));
                return;
            }
            Err(TransferError::Empty(_)) => {
                self.status(format!("File is empty, nothing sent: {}", path.display()));
                return;
            }
            Err(e) => {
                self.status(format!("Error: {}", e));
                return;
            }
        };

        if !self.channel_open {
            warn!(path = %path.display(), "channel not open, file dropped");
            self.status(format!("Channel not open, file not sent: {}", path.display()));
            return;
        }

        let total = chunks.len();
        for chunk in chunks {
            let chunk_id = chunk.chunk_id;
            if let Err(e) = self.send_frame(&Frame::FileChunk(chunk)).await {
                warn!(path = %path.display(), chunk_id, "file send aborted: {}", e);
                self.status(format!("Send error: {}", e));
                return;
            }
        }
        info!(path = %path.display(), chunks = total, "file sent");
    }

    /// Вызывается ровно один раз: после него цикл сессии завершается
    async fn disconnect(&mut self) {
        if self.channel_open {
            if let Err(e) = self.send_frame(&Frame::disconnect()).await {
                debug!("disconnect frame not sent: {}", e);
            }
        }
        emit_chat_text(&self.events, "----disconnected----");
        self.status("Disconnected");

        self.channel_open = false;
        self.pending.clear();
        self.reassembler.abandon_all();
        self.set_phase(Phase::Closed);

        let channel = self.channel.take();
        let relay = self.relay.take();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Some(channel) = channel {
                let _ = channel.close().await;
            }
            if let Err(e) = transport.close().await {
                debug!("transport close failed: {}", e);
            }
            if let Some(relay) = relay {
                relay.close().await;
            }
            debug!("session teardown finished");
        });
        info!("session disconnected");
    }
}

/// Пересылаем события канала в цикл сессии
fn wire_channel(channel: &Arc<dyn DataChannel>, inputs: &mpsc::UnboundedSender<Input>) {
    let inputs = inputs.clone();
    channel.on_event(Box::new(move |event| {
        let _ = inputs.send(Input::Channel(event));
    }));
}
