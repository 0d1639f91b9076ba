use std::sync::atomic::Ordering;
use std::sync::Arc;

use cookie::Cookie;
use poem::http::{header, StatusCode};
use poem::{Body, Endpoint, Request, Response};
use tracing::*;

use crate::session::SessionStore;
use crate::stream::PROTOCOL_VERSION_SESSION_ID;
use crate::MeekError;

/// Accepts every method and path; the protocol lives entirely in cookies
/// and bodies so the rest of the request surface stays unremarkable.
pub(crate) struct MeekEndpoint {
    pub store: Arc<SessionStore>,
}

impl Endpoint for MeekEndpoint {
    type Output = Response;

    async fn call(&self, mut req: Request) -> poem::Result<Self::Output> {
        Ok(self.handle(&mut req).await)
    }
}

impl MeekEndpoint {
    async fn handle(&self, req: &mut Request) -> Response {
        let Some((cookie_name, cookie_value)) = first_cookie(req) else {
            let error = MeekError::BadRequest("no usable cookie");
            debug!(%error, "Rejecting request");
            return terminate_response();
        };

        for name in &self.store.config().prohibited_headers {
            if !name.is_empty() {
                let value = req.headers().get(name.as_str()).cloned();
                warn!(header = %name, ?value, "Prohibited header configured, rejecting request");
                return terminate_response();
            }
        }

        let (session_id, session) = match self.store.get_or_create(req, &cookie_value).await {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(%error, "Rejecting request");
                return terminate_response();
            }
        };

        let body = req.take_body();
        if let Err(error) = session.stream.pump_reads(body.into_async_read()).await {
            warn!(session = %session_id, %error, "Upstream pump failed");
            self.store.close_session(&session_id).await;
            return terminate_response();
        }

        let send_session_id = session.stream.protocol_version() >= PROTOCOL_VERSION_SESSION_ID
            && !session.session_id_sent.swap(true, Ordering::SeqCst);

        let body = match session.stream.pump_writes().await {
            Ok(body) => body,
            Err(error) => {
                warn!(session = %session_id, %error, "Downstream pump failed");
                self.store.close_session(&session_id).await;
                return terminate_response();
            }
        };

        let mut response = Response::builder().status(StatusCode::OK);
        if send_session_id {
            let promoted = Cookie::new(cookie_name, session_id);
            response = response.header(header::SET_COOKIE, promoted.to_string());
        }
        response.body(body)
    }
}

/// The first cookie in iteration order carries the protocol; everything
/// else in the header is camouflage.
fn first_cookie(req: &Request) -> Option<(String, String)> {
    let header = req.headers().get(header::COOKIE)?.to_str().ok()?;
    let first = header.split(';').next()?;
    let parsed = Cookie::parse(first.trim().to_owned()).ok()?;
    if parsed.value().is_empty() {
        return None;
    }
    Some((parsed.name().to_owned(), parsed.value().to_owned()))
}

/// Rejection path: respond 404 and have the connection torn down rather
/// than left for keep-alive reuse.
pub(crate) fn terminate_response() -> Response {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONNECTION, "close")
        .body(Body::empty())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use cloakway_common::helpers::rng::get_crypto_rng;
    use cloakway_common::{MeekConfig, Secret, TunnelConn, TunnelHandler};
    use data_encoding::BASE64;
    use x25519_dalek::{PublicKey, StaticSecret};

    use super::*;
    use crate::cookie::{seal_cookie, CookiePayload};

    /// Echoes upstream bytes downstream. Reading and writing run on
    /// separate tasks so the read side keeps draining request bodies while
    /// a write waits for the next response exchange.
    struct EchoTunnelHandler;

    #[async_trait]
    impl TunnelHandler for EchoTunnelHandler {
        async fn handle_tunnel(
            &self,
            _client_id: String,
            conn: Arc<dyn TunnelConn>,
        ) -> anyhow::Result<()> {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

            let reading = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match reading.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            while let Some(data) = rx.recv().await {
                conn.write_all(&data).await?;
            }
            Ok(())
        }
    }

    fn test_endpoint(config_override: impl FnOnce(&mut MeekConfig)) -> (MeekEndpoint, PublicKey) {
        let secret = StaticSecret::random_from_rng(&mut get_crypto_rng());
        let public = PublicKey::from(&secret);
        let mut config = MeekConfig {
            obfuscated_key: Secret::new("obfuscation".to_owned()),
            cookie_private_key: Secret::new(BASE64.encode(secret.as_bytes())),
            ..Default::default()
        };
        config_override(&mut config);
        let store = SessionStore::new(config, Arc::new(EchoTunnelHandler)).expect("store");
        (
            MeekEndpoint {
                store: Arc::new(store),
            },
            public,
        )
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

    fn request_with_cookie(cookie: &str, body: &str) -> Request {
        Request::builder()
            .method(poem::http::Method::POST)
            .uri_str("http://front.example.com/")
            .header(header::COOKIE, format!("m={cookie}"))
            .body(body.to_owned())
    }

    fn set_cookie_value(response: &Response) -> Option<String> {
        let raw = response.headers().get(header::SET_COOKIE)?.to_str().ok()?;
        let parsed = Cookie::parse(raw.to_owned()).ok()?;
        assert_eq!(parsed.name(), "m");
        Some(parsed.value().to_owned())
    }

    #[tokio::test]
    async fn test_v2_handshake_promotes_session_id_and_echoes() {
        let (endpoint, public) = test_endpoint(|_| {});
        let cookie = sealed_cookie(&public, 2);

        let response = endpoint
            .call(request_with_cookie(&cookie, "hello"))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::OK);

        let session_id = set_cookie_value(&response).expect("session id promoted");
        assert!((8..=20).contains(&session_id.len()));

        let body = response.into_body().into_vec().await.expect("body");
        assert_eq!(body, b"hello");

        // The follow-up request echoes the promoted id and gets no new
        // Set-Cookie.
        let response = endpoint
            .call(request_with_cookie(&session_id, "again"))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let body = response.into_body().into_vec().await.expect("body");
        assert_eq!(body, b"again");
    }

    #[tokio::test]
    async fn test_v1_session_resumes_under_original_cookie() {
        let (endpoint, public) = test_endpoint(|_| {});
        let cookie = sealed_cookie(&public, 1);

        let response = endpoint
            .call(request_with_cookie(&cookie, "ping"))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let body = response.into_body().into_vec().await.expect("body");
        assert_eq!(body, b"ping");

        let response = endpoint
            .call(request_with_cookie(&cookie, "pong"))
            .await
            .expect("call");
        let body = response.into_body().into_vec().await.expect("body");
        assert_eq!(body, b"pong");
        assert_eq!(endpoint.store.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_cookie_is_terminated() {
        let (endpoint, _) = test_endpoint(|_| {});
        let req = Request::builder()
            .uri_str("http://front.example.com/")
            .finish();

        let response = endpoint.call(req).await.expect("call");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response
                .headers()
                .get(header::CONNECTION)
                .and_then(|v| v.to_str().ok()),
            Some("close")
        );
    }

    #[tokio::test]
    async fn test_empty_cookie_value_is_terminated() {
        let (endpoint, _) = test_endpoint(|_| {});
        let req = Request::builder()
            .uri_str("http://front.example.com/")
            .header(header::COOKIE, "m=")
            .finish();

        let response = endpoint.call(req).await.expect("call");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_cookie_is_terminated() {
        let (endpoint, _) = test_endpoint(|_| {});
        let response = endpoint
            .call(request_with_cookie("AAAA", "hello"))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_configured_prohibited_header_rejects_all_requests() {
        // The check fires on configuration alone, whether or not the
        // request carries the header.
        let (endpoint, public) = test_endpoint(|config| {
            config.prohibited_headers = vec!["Via".to_owned()];
        });
        let cookie = sealed_cookie(&public, 2);

        let response = endpoint
            .call(request_with_cookie(&cookie, "hello"))
            .await
            .expect("call");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
