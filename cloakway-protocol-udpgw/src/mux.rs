//! The udpgw multiplexer: one main loop per channel dispatching upstream
//! frames to flows, one downstream relay task per flow.
//!
//! Ownership discipline: the main loop creates flows and closes their
//! sockets by cancelling flow tokens; each relay task is the sole deleter
//! of its own map entry. Between an eviction and the relay's finalization
//! the map may briefly hold a closed flow, which every consumer tolerates.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use cloakway_common::{ConnectionLru, TunnelConn, UdpgwConfig};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::frame::{write_preamble, FrameReader, UdpgwMessage, MAX_MESSAGE, MAX_PAYLOAD};
use crate::monitor::MonitoredSocket;
use crate::UdpgwError;

struct Flow {
    conn_id: u16,
    remote_ip: IpAddr,
    remote_port: u16,
    preamble_size: usize,
    socket: MonitoredSocket,
    done: CancellationToken,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

pub struct UdpgwMux {
    config: UdpgwConfig,
    dns_server: Option<SocketAddr>,
    flows: Mutex<HashMap<u16, Arc<Flow>>>,
    lru: Arc<ConnectionLru>,
    open_count: AtomicUsize,
}

impl UdpgwMux {
    pub fn new(config: UdpgwConfig) -> Arc<Self> {
        let dns_server = config
            .dns_server_address
            .as_deref()
            .and_then(|address| match address.parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    warn!(%address, "Unparseable DNS forward address, ignoring");
                    None
                }
            });
        Arc::new(Self {
            config,
            dns_server,
            flows: Mutex::new(HashMap::new()),
            lru: ConnectionLru::new(),
            open_count: AtomicUsize::new(0),
        })
    }

    /// Runs the channel main loop until EOF, a fatal framing error, or
    /// `stop`. All flows are closed and their relays joined before this
    /// returns.
    pub async fn run(
        self: Arc<Self>,
        conn: Arc<dyn TunnelConn>,
        stop: CancellationToken,
    ) -> Result<(), UdpgwError> {
        let mut reader = FrameReader::new();
        let mut relays = JoinSet::new();

        let result = loop {
            let message = tokio::select! {
                message = reader.next(conn.as_ref()) => message,
                _ = stop.cancelled() => break Ok(()),
            };
            match message {
                Ok(message) => self.dispatch(message, &conn, &mut relays).await,
                Err(UdpgwError::ChannelClosed) => break Ok(()),
                Err(error) => break Err(error),
            }
        };

        {
            let flows = self.flows.lock().await;
            for flow in flows.values() {
                flow.done.cancel();
            }
        }
        while relays.join_next().await.is_some() {}

        result
    }

    async fn dispatch(
        self: &Arc<Self>,
        message: UdpgwMessage<'_>,
        conn: &Arc<dyn TunnelConn>,
        relays: &mut JoinSet<()>,
    ) {
        let mut flow = self.flows.lock().await.get(&message.conn_id).cloned();

        if let Some(existing) = &flow {
            if message.discard_existing_conn {
                debug!(conn_id = message.conn_id, "Rebinding port forward");
                existing.done.cancel();
                flow = None;
            }
        }

        if let Some(existing) = &flow {
            if existing.remote_ip != message.remote_ip
                || existing.remote_port != message.remote_port
            {
                warn!(
                    conn_id = message.conn_id,
                    "Remote address mismatch for existing port forward, dropping packet"
                );
                return;
            }
        }

        let flow = match flow {
            Some(flow) => flow,
            None => match self.open_flow(&message, conn, relays).await {
                Some(flow) => flow,
                None => return,
            },
        };

        if let Err(error) = flow.socket.send(message.packet).await {
            warn!(conn_id = message.conn_id, %error, "UDP send failed, closing port forward");
            flow.done.cancel();
            return;
        }
        flow.bytes_up
            .fetch_add(message.packet.len() as u64, Ordering::Relaxed);
    }

    async fn open_flow(
        self: &Arc<Self>,
        message: &UdpgwMessage<'_>,
        conn: &Arc<dyn TunnelConn>,
        relays: &mut JoinSet<()>,
    ) -> Option<Arc<Flow>> {
        if !self.config.port_permitted(message.remote_port) {
            debug!(
                conn_id = message.conn_id,
                port = message.remote_port,
                "Port forward not permitted"
            );
            return None;
        }

        // Count first, then enforce: an overshoot is resolved by evicting
        // the stalest flow, so the counter can never underflow.
        let open = self.open_count.fetch_add(1, Ordering::SeqCst) + 1;
        if open > self.config.max_port_forward_count {
            self.lru.close_oldest().await;
        }

        let mut dial_address = SocketAddr::new(message.remote_ip, message.remote_port);
        if message.forward_dns {
            if let Some(dns_server) = self.dns_server {
                dial_address = dns_server;
            }
        }

        let socket = match dial_udp(dial_address).await {
            Ok(socket) => socket,
            Err(error) => {
                self.open_count.fetch_sub(1, Ordering::SeqCst);
                let error = UdpgwError::DialFail(error);
                warn!(conn_id = message.conn_id, address = %dial_address, %error, "Port forward dial failed");
                return None;
            }
        };

        let done = CancellationToken::new();
        let lru_entry = self.lru.add(done.clone()).await;
        let flow = Arc::new(Flow {
            conn_id: message.conn_id,
            remote_ip: message.remote_ip,
            remote_port: message.remote_port,
            preamble_size: message.preamble_size,
            socket: MonitoredSocket::new(socket, self.config.idle_timeout, lru_entry),
            done,
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        });
        self.flows
            .lock()
            .await
            .insert(message.conn_id, flow.clone());
        info!(conn_id = message.conn_id, remote = %dial_address, "Port forward opened");

        relays.spawn(self.clone().relay_downstream(flow.clone(), conn.clone()));
        Some(flow)
    }

    async fn relay_downstream(self: Arc<Self>, flow: Arc<Flow>, conn: Arc<dyn TunnelConn>) {
        let mut buffer = vec![0u8; MAX_MESSAGE];
        let preamble_size = flow.preamble_size;

        loop {
            let received = tokio::select! {
                _ = flow.done.cancelled() => break,
                received = flow.socket.recv(&mut buffer[preamble_size..]) => received,
            };
            let packet_size = match received {
                Ok(n) => n,
                Err(_) => break,
            };
            if packet_size > MAX_PAYLOAD {
                warn!(conn_id = flow.conn_id, packet_size, "Oversized UDP packet");
                break;
            }
            if write_preamble(
                &mut buffer,
                preamble_size,
                flow.conn_id,
                flow.remote_ip,
                flow.remote_port,
                packet_size,
            )
            .is_err()
            {
                break;
            }
            if let Err(error) = conn.write_all(&buffer[..preamble_size + packet_size]).await {
                debug!(conn_id = flow.conn_id, %error, "Channel write failed, closing channel");
                conn.close();
                break;
            }
            flow.bytes_down
                .fetch_add(packet_size as u64, Ordering::Relaxed);
        }

        // Sole deleter of the map entry. After a rebind the conn-id may
        // already point at a successor flow, which must stay.
        {
            let mut flows = self.flows.lock().await;
            if let Some(current) = flows.get(&flow.conn_id) {
                if Arc::ptr_eq(current, &flow) {
                    flows.remove(&flow.conn_id);
                }
            }
        }
        flow.socket.lru_entry().remove().await;
        self.open_count.fetch_sub(1, Ordering::SeqCst);
        info!(
            conn_id = flow.conn_id,
            bytes_up = flow.bytes_up.load(Ordering::Relaxed),
            bytes_down = flow.bytes_down.load(Ordering::Relaxed),
            "Port forward closed"
        );
    }

    #[cfg(test)]
    pub(crate) async fn flow_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.flows.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    pub(crate) fn open_flow_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

async fn dial_udp(address: SocketAddr) -> io::Result<UdpSocket> {
    let bind_address: SocketAddr = if address.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind_address).await?;
    socket.connect(address).await?;
    Ok(socket)
}
