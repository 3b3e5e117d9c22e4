use crate::error::TransportError;
use crate::peer::data_channel::WebRtcChannel;
use crate::peer::types::{SdpKind, ServerConfig, SessionDescription};
use crate::peer::{DataChannel, IncomingChannelHandler, TransportAdapter};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Предел длины сообщения data channel у webrtc-rs: SCTP не отправит больше
/// 65536 байт, а буфер чтения канала вмещает 65535. Настройки для него нет.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Транспорт на webrtc: одна RTCPeerConnection на попытку соединения
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcTransport {
    /// создаём Peer с заданными ICE серверами
    pub async fn new(servers: &[ServerConfig]) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(servers)).await?);

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(?state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            match st {
                RTCPeerConnectionState::Connected => info!("peer connection connected"),
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                    warn!(state = ?st, "peer connection lost")
                }
                _ => debug!(state = ?st, "peer connection state changed"),
            }
            Box::pin(async {})
        }));

        Ok(Self { pc })
    }

    /// Ждём окончания сбора кандидатов, чтобы описание было самодостаточным
    async fn gathered_local_description(&self) -> Result<SessionDescription, TransportError> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Description("no local description".into()))?;
        Ok(from_rtc(local))
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    match desc.sdp_type {
        RTCSdpType::Answer => SessionDescription::answer(desc.sdp),
        _ => SessionDescription::offer(desc.sdp),
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::Description(e.to_string()))
}

#[async_trait]
impl TransportAdapter for WebRtcTransport {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        debug!(label, "created local data channel");
        Ok(Arc::new(WebRtcChannel::new(dc)))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        let _ = gather_complete.recv().await;
        self.gathered_local_description().await
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    fn on_incoming_channel(&self, handler: IncomingChannelHandler) {
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                info!(label = dc.label(), "remote data channel announced");
                let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel::new(dc));
                handler(channel);
                Box::pin(async {})
            }));
    }

    fn max_message_size(&self) -> Option<usize> {
        Some(MAX_MESSAGE_SIZE)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(TransportError::from)
    }
}
