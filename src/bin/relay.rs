use anyhow::Context;
use pairchat_lib::config::RelayConfig;
use pairchat_lib::logger;
use pairchat_lib::relay::{self, RoomRegistry};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let config = RelayConfig::from_env();
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("Signalling server listening on {}", addr);
    relay::serve(listener, RoomRegistry::new())
        .await
        .context("relay server stopped")?;
    Ok(())
}
