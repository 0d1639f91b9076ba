use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloakway_common::helpers::rng::get_crypto_rng;
use cloakway_common::{ConnectionRegistry, MeekConfig, TunnelConn, TunnelHandler};
use data_encoding::BASE64URL_NOPAD;
use poem::Request;
use rand::{Rng, RngCore};
use tokio::sync::RwLock;
use tracing::*;
use x25519_dalek::StaticSecret;

use crate::cookie::{decode_cookie, parse_private_key};
use crate::stream::{MeekStream, PROTOCOL_VERSION_SESSION_ID};
use crate::MeekError;

/// Sessions idle longer than this are reaped.
pub const SESSION_STALENESS: Duration = Duration::from_secs(45);

pub const REAP_INTERVAL: Duration = Duration::from_millis(SESSION_STALENESS.as_millis() as u64 / 2);

const SESSION_ID_MIN_LENGTH: usize = 8;
const SESSION_ID_MAX_LENGTH: usize = 20;

pub(crate) struct Session {
    pub stream: Arc<MeekStream>,
    pub session_id_sent: AtomicBool,
    last_activity_millis: AtomicI64,
    registry_id: u64,
}

impl Session {
    fn touch(&self, now_millis: i64) {
        self.last_activity_millis.store(now_millis, Ordering::Relaxed);
    }
}

pub struct SessionStore {
    config: MeekConfig,
    private_key: StaticSecret,
    handler: Arc<dyn TunnelHandler>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    registry: ConnectionRegistry,
    epoch: tokio::time::Instant,
}

impl SessionStore {
    pub fn new(config: MeekConfig, handler: Arc<dyn TunnelHandler>) -> Result<Self, MeekError> {
        let private_key = parse_private_key(config.cookie_private_key.expose_secret())?;
        Ok(Self {
            config,
            private_key,
            handler,
            sessions: RwLock::new(HashMap::new()),
            registry: ConnectionRegistry::new(),
            epoch: tokio::time::Instant::now(),
        })
    }

    pub(crate) fn config(&self) -> &MeekConfig {
        &self.config
    }

    /// Resolves a request to its session: an existing one when the cookie
    /// value is a live session key, otherwise a fresh session built from a
    /// decoded cookie, with the tunnel handler started on its own task.
    pub(crate) async fn get_or_create(
        &self,
        req: &Request,
        cookie_value: &str,
    ) -> Result<(String, Arc<Session>), MeekError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(cookie_value) {
                session.touch(self.now_millis());
                return Ok((cookie_value.to_owned(), session.clone()));
            }
        }

        let payload = decode_cookie(
            self.config.obfuscated_key.expose_secret(),
            &self.private_key,
            cookie_value,
        )?;

        let client_ip = self.client_ip_for_request(req);
        let stream = MeekStream::new(SocketAddr::new(client_ip, 0), payload.version);

        let session_id = if payload.version < PROTOCOL_VERSION_SESSION_ID {
            cookie_value.to_owned()
        } else {
            generate_session_id()
        };

        let registry_id = self.registry.register(stream.shutdown_token()).await;
        let session = Arc::new(Session {
            stream: stream.clone(),
            session_id_sent: AtomicBool::new(false),
            last_activity_millis: AtomicI64::new(self.now_millis()),
            registry_id,
        });
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());

        info!(
            session = %session_id,
            client_ip = %client_ip,
            version = payload.version,
            "Session created"
        );

        let handler = self.handler.clone();
        let handler_session_id = session_id.clone();
        let conn: Arc<dyn TunnelConn> = stream;
        tokio::spawn(async move {
            if let Err(error) = handler.handle_tunnel(handler_session_id.clone(), conn).await {
                warn!(session = %handler_session_id, %error, "Tunnel handler failed");
            }
        });

        Ok((session_id, session))
    }

    pub async fn close_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(session_id) {
            info!(session = %session_id, "Session closed");
            session.stream.close();
            self.registry.remove(session.registry_id).await;
        }
    }

    /// Closes and removes every session idle longer than
    /// [`SESSION_STALENESS`].
    pub async fn reap(&self) {
        let now = self.now_millis();
        let stale_after = SESSION_STALENESS.as_millis() as i64;

        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| {
                now - session.last_activity_millis.load(Ordering::Relaxed) > stale_after
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            if let Some(session) = sessions.remove(&id) {
                info!(session = %id, "Reaping stale session");
                session.stream.close();
                self.registry.remove(session.registry_id).await;
            }
        }
    }

    /// Force-closes everything at shutdown.
    pub async fn stop(&self) {
        self.registry.close_all().await;
        let mut sessions = self.sessions.write().await;
        for (id, session) in sessions.drain() {
            debug!(session = %id, "Closing session at shutdown");
            session.stream.close();
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn now_millis(&self) -> i64 {
        (tokio::time::Instant::now() - self.epoch).as_millis() as i64
    }

    fn client_ip_for_request(&self, req: &Request) -> IpAddr {
        let mut client_ip = req
            .remote_addr()
            .as_socket_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        for header_name in &self.config.proxy_forwarded_for_headers {
            let has_value = req
                .headers()
                .get(header_name.as_str())
                .map(|value| !value.is_empty())
                .unwrap_or(false);
            if !has_value {
                continue;
            }
            let Some(candidate) = header_name.split(',').next() else {
                continue;
            };
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                client_ip = ip;
                break;
            }
        }

        client_ip
    }
}

fn generate_session_id() -> String {
    let mut rng = get_crypto_rng();
    let len = rng.gen_range(SESSION_ID_MIN_LENGTH..=SESSION_ID_MAX_LENGTH);
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    let mut id = BASE64URL_NOPAD.encode(&bytes);
    id.truncate(len);
    id
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use cloakway_common::Secret;
    use data_encoding::BASE64;
    use x25519_dalek::PublicKey;

    use super::*;
    use crate::cookie::{seal_cookie, CookiePayload};

    struct IdleTunnelHandler;

    #[async_trait]
    impl TunnelHandler for IdleTunnelHandler {
        async fn handle_tunnel(
            &self,
            _client_id: String,
            conn: Arc<dyn TunnelConn>,
        ) -> anyhow::Result<()> {
            let mut buf = [0u8; 64];
            while conn.read(&mut buf).await? > 0 {}
            Ok(())
        }
    }

    fn test_store(config_override: impl FnOnce(&mut MeekConfig)) -> (SessionStore, PublicKey) {
        let secret = StaticSecret::random_from_rng(&mut get_crypto_rng());
        let public = PublicKey::from(&secret);
        let mut config = MeekConfig {
            obfuscated_key: Secret::new("obfuscation".to_owned()),
            cookie_private_key: Secret::new(BASE64.encode(secret.as_bytes())),
            ..Default::default()
        };
        config_override(&mut config);
        let store = SessionStore::new(config, Arc::new(IdleTunnelHandler)).expect("store");
        (store, public)
    }

    fn sealed_cookie(public: &PublicKey, version: i32) -> String {
        seal_cookie(
            "obfuscation",
            public,
            &CookiePayload {
                version,
                session_token: "sid".to_owned(),
                peer_address: "1.2.3.4".to_owned(),
            },
        )
        .expect("seal")
    }

    #[tokio::test]
    async fn test_v2_session_gets_generated_id() {
        let (store, public) = test_store(|_| {});
        let cookie = sealed_cookie(&public, 2);
        let req = Request::builder().finish();

        let (session_id, session) = store.get_or_create(&req, &cookie).await.expect("create");
        assert_ne!(session_id, cookie);
        assert!((SESSION_ID_MIN_LENGTH..=SESSION_ID_MAX_LENGTH).contains(&session_id.len()));
        assert_eq!(session.stream.protocol_version(), 2);

        // The generated id resolves the session without another decode.
        let (again_id, again) = store.get_or_create(&req, &session_id).await.expect("hit");
        assert_eq!(again_id, session_id);
        assert!(Arc::ptr_eq(&again, &session));
    }

    #[tokio::test]
    async fn test_v1_session_is_keyed_by_cookie() {
        let (store, public) = test_store(|_| {});
        let cookie = sealed_cookie(&public, 1);
        let req = Request::builder().finish();

        let (session_id, session) = store.get_or_create(&req, &cookie).await.expect("create");
        assert_eq!(session_id, cookie);

        let (_, again) = store.get_or_create(&req, &cookie).await.expect("hit");
        assert!(Arc::ptr_eq(&again, &session));
    }

    #[tokio::test]
    async fn test_undecodable_cookie_is_rejected() {
        let (store, _) = test_store(|_| {});
        let req = Request::builder().finish();
        let result = store.get_or_create(&req, "AAAA").await;
        assert!(matches!(result, Err(MeekError::BadCookie(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_removes_stale_sessions() {
        let (store, public) = test_store(|_| {});
        let cookie = sealed_cookie(&public, 2);
        let req = Request::builder().finish();

        let (session_id, session) = store.get_or_create(&req, &cookie).await.expect("create");
        assert_eq!(store.session_count().await, 1);

        tokio::time::advance(Duration::from_secs(46)).await;
        store.reap().await;

        assert_eq!(store.session_count().await, 0);
        assert!(session.stream.is_closed());

        // The old cookie starts over with a fresh session.
        let (new_id, new_session) = store.get_or_create(&req, &cookie).await.expect("recreate");
        assert_ne!(new_id, session_id);
        assert!(!Arc::ptr_eq(&new_session, &session));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_sessions_survive_the_reaper() {
        let (store, public) = test_store(|_| {});
        let cookie = sealed_cookie(&public, 2);
        let req = Request::builder().finish();

        let (session_id, _) = store.get_or_create(&req, &cookie).await.expect("create");

        tokio::time::advance(Duration::from_secs(30)).await;
        store.get_or_create(&req, &session_id).await.expect("touch");
        tokio::time::advance(Duration::from_secs(30)).await;
        store.reap().await;

        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_closes_all_sessions() {
        let (store, public) = test_store(|_| {});
        let req = Request::builder().finish();
        let (_, first) = store
            .get_or_create(&req, &sealed_cookie(&public, 2))
            .await
            .expect("first");
        let (_, second) = store
            .get_or_create(&req, &sealed_cookie(&public, 2))
            .await
            .expect("second");

        store.stop().await;
        assert!(first.stream.is_closed());
        assert!(second.stream.is_closed());
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_forwarded_for_header_name_is_what_gets_parsed() {
        // The override splits the configured header *name*, so a normal
        // header name never parses as an IP and never overrides.
        let (store, public) = test_store(|config| {
            config.proxy_forwarded_for_headers = vec!["X-Forwarded-For".to_owned()];
        });
        let req = Request::builder()
            .header("X-Forwarded-For", "9.9.9.9")
            .finish();
        let (_, session) = store
            .get_or_create(&req, &sealed_cookie(&public, 2))
            .await
            .expect("create");
        assert_eq!(
            session.stream.remote_addr().ip(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );

        // A header name that itself parses as an IP does override, as long
        // as the request carries the header with any value.
        let (store, public) = test_store(|config| {
            config.proxy_forwarded_for_headers = vec!["10.0.0.9".to_owned()];
        });
        let req = Request::builder().header("10.0.0.9", "ignored").finish();
        let (_, session) = store
            .get_or_create(&req, &sealed_cookie(&public, 2))
            .await
            .expect("create");
        assert_eq!(
            session.stream.remote_addr().ip(),
            "10.0.0.9".parse::<IpAddr>().expect("ip")
        );
    }

    #[test]
    fn test_generated_session_ids_stay_in_bounds() {
        for _ in 0..200 {
            let id = generate_session_id();
            assert!((SESSION_ID_MIN_LENGTH..=SESSION_ID_MAX_LENGTH).contains(&id.len()));
            assert!(id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }
}
