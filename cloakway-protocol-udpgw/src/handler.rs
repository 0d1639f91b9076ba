use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cloakway_common::{TunnelConn, TunnelHandler, UdpgwConfig};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::mux::UdpgwMux;

struct ChannelSlot {
    generation: u64,
    replaced: CancellationToken,
}

/// Runs the udpgw multiplexer over each tunnel client's stream.
///
/// A client gets at most one live udpgw channel: attaching a new channel
/// closes the previous one under the registry lock before the new one is
/// installed.
pub struct UdpgwTunnelHandler {
    config: UdpgwConfig,
    next_generation: AtomicU64,
    channels: Mutex<HashMap<String, ChannelSlot>>,
}

impl UdpgwTunnelHandler {
    pub fn new(config: UdpgwConfig) -> Self {
        Self {
            config,
            next_generation: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }
}

#[async_trait]
impl TunnelHandler for UdpgwTunnelHandler {
    async fn handle_tunnel(
        &self,
        client_id: String,
        conn: Arc<dyn TunnelConn>,
    ) -> anyhow::Result<()> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let replaced = CancellationToken::new();
        {
            let mut channels = self.channels.lock().await;
            if let Some(previous) = channels.insert(
                client_id.clone(),
                ChannelSlot {
                    generation,
                    replaced: replaced.clone(),
                },
            ) {
                debug!(client = %client_id, "Replacing existing udpgw channel");
                previous.replaced.cancel();
            }
        }

        let mux = UdpgwMux::new(self.config.clone());
        let result = mux.run(conn.clone(), replaced.clone()).await;

        // The channel is this tunnel's only consumer; when it ends, so does
        // the stream.
        conn.close();

        {
            let mut channels = self.channels.lock().await;
            if channels
                .get(&client_id)
                .map(|slot| slot.generation == generation)
                .unwrap_or(false)
            {
                channels.remove(&client_id);
            }
        }

        match result {
            Ok(()) => {
                debug!(client = %client_id, "udpgw channel closed");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}
