mod cookie;
mod endpoint;
mod error;
mod session;
mod stream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cloakway_common::tls::TlsCertificateAndPrivateKey;
use cloakway_common::{MeekConfig, TunnelHandler};
pub use error::MeekError;
use poem::listener::{Listener, RustlsConfig, TcpListener};
use poem::Server;
pub use session::{SessionStore, REAP_INTERVAL, SESSION_STALENESS};
pub use stream::{MeekStream, MAX_PAYLOAD};
use tokio_util::sync::CancellationToken;
use tracing::*;

pub use crate::cookie::{decode_cookie, parse_private_key, seal_cookie, CookiePayload};
use crate::endpoint::MeekEndpoint;

pub struct MeekProtocolServer {
    config: MeekConfig,
    handler: Arc<dyn TunnelHandler>,
}

impl MeekProtocolServer {
    pub fn new(config: MeekConfig, handler: Arc<dyn TunnelHandler>) -> Self {
        Self { config, handler }
    }

    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        let store = Arc::new(SessionStore::new(self.config.clone(), self.handler)?);

        tokio::spawn({
            let store = store.clone();
            let stop = stop.clone();
            async move {
                let mut interval = tokio::time::interval(REAP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => store.reap().await,
                        _ = stop.cancelled() => break,
                    }
                }
            }
        });

        let endpoint = MeekEndpoint {
            store: store.clone(),
        };

        let address = self.config.listen.clone();
        info!(%address, https = self.config.https, "Listening");

        if self.config.https {
            let certificate_and_key = match (&self.config.certificate, &self.config.key) {
                (Some(certificate), Some(key)) => {
                    TlsCertificateAndPrivateKey::from_files(certificate, key).await?
                }
                _ => TlsCertificateAndPrivateKey::self_signed(
                    &self.config.certificate_common_name,
                )?,
            };
            Server::new(
                TcpListener::bind(address)
                    .rustls(RustlsConfig::new().fallback(certificate_and_key.into())),
            )
            .run_with_graceful_shutdown(endpoint, stop.cancelled_owned(), Some(Duration::ZERO))
            .await?;
        } else {
            Server::new(TcpListener::bind(address))
                .run_with_graceful_shutdown(endpoint, stop.cancelled_owned(), Some(Duration::ZERO))
                .await?;
        }

        store.stop().await;
        Ok(())
    }
}
