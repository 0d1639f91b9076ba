use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::CloakwayError;

/// The connected-stream contract handed to a [`TunnelHandler`].
///
/// Backed by the meek session layer rather than a socket: reads and writes
/// rendezvous with HTTP exchanges. Cancellation is by [`TunnelConn::close`]
/// only; deadlines are not supported.
#[async_trait]
pub trait TunnelConn: Send + Sync + 'static {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Idempotent. Interrupts all pending reads and writes.
    fn close(&self);

    fn remote_addr(&self) -> SocketAddr;

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed",
                ));
            }
            written += n;
        }
        Ok(())
    }

    fn set_read_deadline(&self, _deadline: Option<Duration>) -> Result<(), CloakwayError> {
        Err(CloakwayError::NotSupported("read deadline"))
    }

    fn set_write_deadline(&self, _deadline: Option<Duration>) -> Result<(), CloakwayError> {
        Err(CloakwayError::NotSupported("write deadline"))
    }
}

/// Invoked once per tunnel client with its connected stream.
#[async_trait]
pub trait TunnelHandler: Send + Sync + 'static {
    async fn handle_tunnel(
        &self,
        client_id: String,
        conn: Arc<dyn TunnelConn>,
    ) -> anyhow::Result<()>;
}
