#[derive(thiserror::Error, Debug)]
pub enum UdpgwError {
    #[error("bad frame: {0}")]
    BadFrame(&'static str),
    #[error("channel closed")]
    ChannelClosed,
    #[error("udp dial failed: {0}")]
    DialFail(#[source] std::io::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}
