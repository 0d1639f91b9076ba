use std::sync::Arc;

use anyhow::Result;
use cloakway_protocol_meek::MeekProtocolServer;
use cloakway_protocol_udpgw::UdpgwTunnelHandler;
use time::{format_description, UtcOffset};
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod config;

use crate::config::load_config;

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let env_filter = Arc::new(EnvFilter::from_default_env());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(OffsetTime::new(
            offset,
            format_description::parse("[day].[month].[year] [hour]:[minute]:[second]").unwrap(),
        ))
        .with_filter(dynamic_filter_fn(move |m, c| {
            env_filter.enabled(m, c.clone())
        }));

    tracing_subscriber::registry().with(fmt_layer).init();

    let config = load_config()?;

    let handler = Arc::new(UdpgwTunnelHandler::new(config.udpgw.clone()));
    let stop = CancellationToken::new();

    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                stop.cancel();
            }
        }
    });

    MeekProtocolServer::new(config.meek.clone(), handler)
        .run(stop)
        .await?;
    info!("Exiting");
    Ok(())
}
