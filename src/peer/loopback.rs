//! Транспорт внутри процесса: два адаптера из одной `LoopbackNetwork`
//! обмениваются описаниями через сигнальный сервер как настоящие пиры,
//! а после answer получают связанную пару каналов.

use crate::error::TransportError;
use crate::peer::types::{SdpKind, SessionDescription};
use crate::peer::{
    ChannelEvent, ChannelEventHandler, DataChannel, IncomingChannelHandler, TransportAdapter,
};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

const SDP_PREFIX: &str = "loopback:";

/// Реестр адаптеров, видимых друг другу
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    peers: Arc<Mutex<HashMap<String, Weak<Inner>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> LoopbackTransport {
        let inner = Arc::new(Inner {
            id: random_id(),
            local_channel: Mutex::new(None),
            incoming: Mutex::new(None),
            local_kind: Mutex::new(None),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.peers
            .lock()
            .insert(inner.id.clone(), Arc::downgrade(&inner));
        LoopbackTransport {
            inner,
            network: self.clone(),
        }
    }

    fn lookup(&self, desc: &SessionDescription) -> Result<Arc<Inner>, TransportError> {
        let id = desc
            .sdp
            .strip_prefix(SDP_PREFIX)
            .ok_or_else(|| TransportError::Description(format!("unknown sdp: {}", desc.sdp)))?;
        self.peers
            .lock()
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Description(format!("no loopback peer {id}")))
    }
}

struct Inner {
    id: String,
    local_channel: Mutex<Option<Arc<LoopbackChannel>>>,
    incoming: Mutex<Option<Arc<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>>>,
    local_kind: Mutex<Option<SdpKind>>,
    remote: Mutex<Option<Arc<Inner>>>,
    closed: AtomicBool,
}

pub struct LoopbackTransport {
    inner: Arc<Inner>,
    network: LoopbackNetwork,
}

impl LoopbackTransport {
    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            sdp: format!("{SDP_PREFIX}{}", self.inner.id),
            kind,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Связываем локальный канал offerer-а с новым каналом у answerer-а
    fn link(&self, answerer: &Arc<Inner>) -> Result<(), TransportError> {
        let local = self
            .inner
            .local_channel
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Setup("offer side has no channel".into()))?;
        let remote = Arc::new(LoopbackChannel::new(&local.label));
        LoopbackChannel::pair(&local, &remote);
        *answerer.local_channel.lock() = Some(remote.clone());

        let incoming = answerer.incoming.lock().clone();
        if let Some(handler) = incoming {
            let channel: Arc<dyn DataChannel> = remote.clone();
            handler(channel);
        }
        debug!(offerer = %self.inner.id, answerer = %answerer.id, "loopback channels linked");
        // answerer узнаёт об открытии раньше, чем offerer успеет что-то отправить
        remote.mark_open();
        local.mark_open();
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.ensure_open()?;
        let channel = Arc::new(LoopbackChannel::new(label));
        *self.inner.local_channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if self.inner.remote.lock().is_none() {
            return Err(TransportError::Description(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        *self.inner.local_kind.lock() = Some(desc.kind);
        Ok(desc)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let local_kind = *self.inner.local_kind.lock();
        let peer = self.network.lookup(&desc)?;
        match (desc.kind, local_kind) {
            // новый offer после завершённого обмена: переподключение
            (SdpKind::Offer, None | Some(SdpKind::Answer)) => {
                *self.inner.remote.lock() = Some(peer);
                Ok(())
            }
            (SdpKind::Answer, Some(SdpKind::Offer)) => {
                *self.inner.remote.lock() = Some(peer.clone());
                self.link(&peer)
            }
            (kind, local) => Err(TransportError::Description(format!(
                "cannot apply remote {kind:?} with local {local:?}"
            ))),
        }
    }

    fn on_incoming_channel(&self, handler: IncomingChannelHandler) {
        *self.inner.incoming.lock() = Some(Arc::from(handler));
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channel = self.inner.local_channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await?;
        }
        self.inner.remote.lock().take();
        self.network.peers.lock().remove(&self.inner.id);
        Ok(())
    }
}

/// Половина связанной пары каналов
pub struct LoopbackChannel {
    label: String,
    open: AtomicBool,
    handler: Mutex<Option<Arc<dyn Fn(ChannelEvent) + Send + Sync>>>,
    // события до подписки не теряются
    backlog: Mutex<Vec<ChannelEvent>>,
    peer: Mutex<Weak<LoopbackChannel>>,
}

impl LoopbackChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            handler: Mutex::new(None),
            backlog: Mutex::new(Vec::new()),
            peer: Mutex::new(Weak::new()),
        }
    }

    fn pair(a: &Arc<LoopbackChannel>, b: &Arc<LoopbackChannel>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    fn dispatch(&self, event: ChannelEvent) {
        let handler = {
            let guard = self.handler.lock();
            match guard.as_ref() {
                Some(handler) => handler.clone(),
                None => {
                    self.backlog.lock().push(event);
                    return;
                }
            }
        };
        handler(event);
    }

    fn mark_open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.dispatch(ChannelEvent::Open);
        }
    }

    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.dispatch(ChannelEvent::Close);
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_event(&self, handler: ChannelEventHandler) {
        let handler: Arc<dyn Fn(ChannelEvent) + Send + Sync> = Arc::from(handler);
        let mut slot = self.handler.lock();
        let backlog: Vec<ChannelEvent> = self.backlog.lock().drain(..).collect();
        for event in backlog {
            handler(event);
        }
        *slot = Some(handler);
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        let peer = self
            .peer
            .lock()
            .upgrade()
            .ok_or(TransportError::ChannelClosed)?;
        peer.dispatch(ChannelEvent::Message(Bytes::from(text)));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.mark_closed();
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.mark_closed();
        }
        Ok(())
    }
}
