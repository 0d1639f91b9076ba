//! The stream adapter: presents one logical connected byte stream to the
//! tunnel handler while the bytes actually move through a sequence of HTTP
//! request and response bodies.
//!
//! Each direction is a rendezvous: the HTTP side offers a request-body
//! reader (`pump_reads`) or collects response chunks (`pump_writes`), the
//! tunnel side consumes and produces through [`MeekStream::read`] and
//! [`MeekStream::write`]. Every hand-off carries a oneshot ack so neither
//! side runs ahead of the other, and every await races the close signal.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cloakway_common::TunnelConn;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::MeekError;

/// Largest chunk offered to the HTTP response per write rendezvous.
pub const MAX_PAYLOAD: usize = 65536;

/// Idle wait before a response is flushed, so small writes batch up.
const TURN_AROUND: Duration = Duration::from_millis(20);

/// Absolute cap on how long one response may keep accumulating.
const EXTENDED_TURN_AROUND: Duration = Duration::from_millis(100);

/// First protocol version in which the server issues its own session ids
/// and may stack multiple payloads into one response.
pub(crate) const PROTOCOL_VERSION_SESSION_ID: i32 = 2;

struct ReaderLease {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    done: oneshot::Sender<io::Result<()>>,
}

struct WriteChunk {
    data: Bytes,
    done: oneshot::Sender<io::Result<()>>,
}

struct ReadState {
    reader_rx: mpsc::Receiver<ReaderLease>,
    current: Option<ReaderLease>,
}

pub struct MeekStream {
    remote_addr: SocketAddr,
    protocol_version: i32,
    shutdown: CancellationToken,
    reader_tx: mpsc::Sender<ReaderLease>,
    chunk_tx: mpsc::Sender<WriteChunk>,
    read_state: Mutex<ReadState>,
    write_serial: Mutex<()>,
    chunk_rx: Mutex<mpsc::Receiver<WriteChunk>>,
}

impl MeekStream {
    pub fn new(remote_addr: SocketAddr, protocol_version: i32) -> Arc<Self> {
        let (reader_tx, reader_rx) = mpsc::channel(1);
        let (chunk_tx, chunk_rx) = mpsc::channel(1);
        Arc::new(Self {
            remote_addr,
            protocol_version,
            shutdown: CancellationToken::new(),
            reader_tx,
            chunk_tx,
            read_state: Mutex::new(ReadState {
                reader_rx,
                current: None,
            }),
            write_serial: Mutex::new(()),
            chunk_rx: Mutex::new(chunk_rx),
        })
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled exactly once, when the stream closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Offers a request body to the tunnel side and waits until it has been
    /// drained. A closed stream ends the pump cleanly, like the end of any
    /// other exchange.
    pub async fn pump_reads(
        &self,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> io::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let lease = ReaderLease {
            reader: Box::new(reader),
            done: done_tx,
        };

        tokio::select! {
            sent = self.reader_tx.send(lease) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
            _ = self.shutdown.cancelled() => return Ok(()),
        }

        tokio::select! {
            result = done_rx => result.unwrap_or(Ok(())),
            _ = self.shutdown.cancelled() => Ok(()),
        }
    }

    /// Collects tunnel writes into one response body under the turn-around
    /// policy: flush after [`TURN_AROUND`] of idleness, hard-stop at
    /// [`EXTENDED_TURN_AROUND`], and for protocol v1 after the first chunk.
    pub async fn pump_writes(&self) -> io::Result<Vec<u8>> {
        let mut chunk_rx = self.chunk_rx.lock().await;
        let started = tokio::time::Instant::now();
        let mut body = Vec::new();

        let flush = tokio::time::sleep(TURN_AROUND);
        tokio::pin!(flush);

        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => {
                    let Some(chunk) = chunk else {
                        return Ok(body);
                    };
                    body.extend_from_slice(&chunk.data);
                    let _ = chunk.done.send(Ok(()));

                    if self.protocol_version < PROTOCOL_VERSION_SESSION_ID {
                        return Ok(body);
                    }
                    if started.elapsed() >= EXTENDED_TURN_AROUND {
                        return Ok(body);
                    }
                    flush.as_mut().reset(tokio::time::Instant::now() + TURN_AROUND);
                }
                _ = &mut flush => return Ok(body),
                _ = self.shutdown.cancelled() => return Ok(body),
            }
        }
    }

    async fn read_inner(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.read_state.lock().await;
        loop {
            if state.current.is_none() {
                tokio::select! {
                    lease = state.reader_rx.recv() => {
                        let Some(lease) = lease else { return Ok(0) };
                        state.current = Some(lease);
                    }
                    _ = self.shutdown.cancelled() => return Ok(0),
                }
            }

            let Some(lease) = state.current.as_mut() else {
                continue;
            };
            let result = tokio::select! {
                result = lease.reader.read(buf) => result,
                _ = self.shutdown.cancelled() => return Ok(0),
            };

            match result {
                // This body is drained; release the pump and wait for the
                // next exchange to offer another one.
                Ok(0) => {
                    if let Some(lease) = state.current.take() {
                        let _ = lease.done.send(Ok(()));
                    }
                }
                Ok(n) => return Ok(n),
                Err(error) => {
                    if let Some(lease) = state.current.take() {
                        let _ = lease
                            .done
                            .send(Err(io::Error::new(error.kind(), error.to_string())));
                    }
                    return Err(error);
                }
            }
        }
    }

    async fn write_inner(&self, buf: &[u8]) -> io::Result<usize> {
        let _serial = self.write_serial.lock().await;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        for chunk in buf.chunks(MAX_PAYLOAD) {
            let (done_tx, done_rx) = oneshot::channel();
            let item = WriteChunk {
                data: Bytes::copy_from_slice(chunk),
                done: done_tx,
            };

            tokio::select! {
                sent = self.chunk_tx.send(item) => {
                    if sent.is_err() {
                        return Err(closed_error());
                    }
                }
                _ = self.shutdown.cancelled() => return Err(closed_error()),
            }

            tokio::select! {
                result = done_rx => match result {
                    Ok(Ok(())) => written += chunk.len(),
                    Ok(Err(error)) => return Err(error),
                    Err(_) => return Err(closed_error()),
                },
                _ = self.shutdown.cancelled() => return Err(closed_error()),
            }
        }
        Ok(written)
    }
}

#[async_trait]
impl TunnelConn for MeekStream {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.write_inner(buf).await
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, MeekError::SessionGone)
}
