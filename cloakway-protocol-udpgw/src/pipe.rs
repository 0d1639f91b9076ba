//! In-memory [`TunnelConn`] pair for exercising channel code in tests.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use cloakway_common::TunnelConn;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub(crate) struct PipeConn {
    read_half: Mutex<ReadHalf<DuplexStream>>,
    write_half: Mutex<WriteHalf<DuplexStream>>,
    closed: CancellationToken,
}

impl PipeConn {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (Arc::new(Self::new(a)), Arc::new(Self::new(b)))
    }

    fn new(stream: DuplexStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            closed: CancellationToken::new(),
        }
    }

    /// Signals EOF to the peer without closing this side's read direction.
    pub async fn shut(&self) {
        let _ = self.write_half.lock().await.shutdown().await;
    }
}

#[async_trait]
impl TunnelConn for PipeConn {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut half = self.read_half.lock().await;
        tokio::select! {
            result = half.read(buf) => result,
            _ = self.closed.cancelled() => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "pipe closed"));
        }
        self.write_half.lock().await.write(buf).await
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }
}
