#[derive(thiserror::Error, Debug)]
pub enum MeekError {
    #[error("bad cookie: {0}")]
    BadCookie(&'static str),
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error("session closed")]
    SessionGone,
    #[error("invalid cookie private key")]
    InvalidPrivateKey,
}
