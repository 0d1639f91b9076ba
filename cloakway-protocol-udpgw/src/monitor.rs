use std::io;
use std::time::Duration;

use cloakway_common::LruHandle;
use tokio::net::UdpSocket;

/// Connected UDP socket that refreshes its LRU position on every successful
/// operation and bounds reads with the idle timeout.
pub(crate) struct MonitoredSocket {
    socket: UdpSocket,
    idle_timeout: Duration,
    lru_entry: LruHandle,
}

impl MonitoredSocket {
    pub fn new(socket: UdpSocket, idle_timeout: Duration, lru_entry: LruHandle) -> Self {
        Self {
            socket,
            idle_timeout,
            lru_entry,
        }
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match tokio::time::timeout(self.idle_timeout, self.socket.recv(buf)).await {
            Ok(result) => {
                if result.is_ok() {
                    self.lru_entry.touch().await;
                }
                result
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle port forward")),
        }
    }

    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let result = self.socket.send(buf).await;
        if result.is_ok() {
            self.lru_entry.touch().await;
        }
        result
    }

    pub fn lru_entry(&self) -> &LruHandle {
        &self.lru_entry
    }
}
