pub mod config;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod utils;

pub use config::{ClientConfig, RelayConfig};
pub use logger::{ChatLine, FileReady, UiEvent};
pub use peer::{DataChannel, LoopbackNetwork, TransportAdapter, WebRtcTransport};
pub use relay::RoomRegistry;
pub use session::{Phase, SessionHandle};
