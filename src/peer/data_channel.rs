use crate::error::TransportError;
use crate::peer::{ChannelEvent, ChannelEventHandler, DataChannel};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Data channel поверх webrtc
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    /// общий обработчик data-channel
    fn on_event(&self, handler: ChannelEventHandler) {
        let handler: Arc<dyn Fn(ChannelEvent) + Send + Sync> = Arc::from(handler);
        let label = self.label();
        debug!(%label, "attaching data channel handlers");

        // если канал уже открыт, webrtc вызовет on_open сразу
        self.dc.on_open(Box::new({
            let handler = handler.clone();
            let label = label.clone();
            move || {
                info!(%label, "data channel opened");
                handler(ChannelEvent::Open);
                Box::pin(async {})
            }
        }));

        self.dc.on_message(Box::new({
            let handler = handler.clone();
            move |msg: DataChannelMessage| {
                debug!(len = msg.data.len(), is_string = msg.is_string, "data channel message");
                handler(ChannelEvent::Message(msg.data));
                Box::pin(async {})
            }
        }));

        self.dc.on_close(Box::new(move || {
            info!(%label, "data channel closed");
            handler(ChannelEvent::Close);
            Box::pin(async {})
        }));
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await.map_err(TransportError::from)
    }
}
