//! The udpgw wire framing.
//!
//! Every frame is `size:u16le | flags:u8 | conn_id:u16le | addr:(4|16)B |
//! port:u16le | packet`, where `size` counts everything after itself. The
//! preamble is 11 bytes for IPv4 and 23 for IPv6; keepalive frames carry no
//! flow semantics and are consumed by the reader.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;
use cloakway_common::TunnelConn;

use crate::UdpgwError;

/// Largest UDP payload carried in one frame.
pub const MAX_PAYLOAD: usize = 32768;

pub const IPV4_PREAMBLE: usize = 11;
pub const IPV6_PREAMBLE: usize = 23;
pub const MAX_PREAMBLE: usize = IPV6_PREAMBLE;

/// Scratch buffer size covering any single frame.
pub const MAX_MESSAGE: usize = MAX_PREAMBLE + MAX_PAYLOAD;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const KEEPALIVE = 1;
        const REBIND = 2;
        const DNS = 4;
        const IPV6 = 8;
    }
}

/// One decoded upstream frame. `packet` borrows the reader's scratch buffer
/// and is only valid until the next decode.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpgwMessage<'a> {
    pub conn_id: u16,
    pub preamble_size: usize,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub discard_existing_conn: bool,
    pub forward_dns: bool,
    pub packet: &'a [u8],
}

/// Parses the frame content after the size prefix. Returns `None` for
/// keepalives.
pub fn parse_frame(frame: &[u8]) -> Result<Option<UdpgwMessage<'_>>, UdpgwError> {
    if frame.len() < 3 {
        return Err(UdpgwError::BadFrame("frame too short"));
    }
    let flags = FrameFlags::from_bits_retain(frame[0]);
    let conn_id = u16::from_le_bytes([frame[1], frame[2]]);
    if flags.contains(FrameFlags::KEEPALIVE) {
        return Ok(None);
    }

    let (remote_ip, remote_port, preamble_size, packet_offset) =
        if flags.contains(FrameFlags::IPV6) {
            if frame.len() < 21 {
                return Err(UdpgwError::BadFrame("truncated ipv6 preamble"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&frame[3..19]);
            (
                IpAddr::V6(Ipv6Addr::from(octets)),
                u16::from_le_bytes([frame[19], frame[20]]),
                IPV6_PREAMBLE,
                21,
            )
        } else {
            if frame.len() < 9 {
                return Err(UdpgwError::BadFrame("truncated ipv4 preamble"));
            }
            (
                IpAddr::V4(Ipv4Addr::new(frame[3], frame[4], frame[5], frame[6])),
                u16::from_le_bytes([frame[7], frame[8]]),
                IPV4_PREAMBLE,
                9,
            )
        };

    Ok(Some(UdpgwMessage {
        conn_id,
        preamble_size,
        remote_ip,
        remote_port,
        discard_existing_conn: flags.contains(FrameFlags::REBIND),
        forward_dns: flags.contains(FrameFlags::DNS),
        packet: &frame[packet_offset..],
    }))
}

/// Encodes a downstream preamble into `buf[..preamble_size]`, ahead of a
/// packet of `packet_len` bytes already placed at `buf[preamble_size..]`.
/// The preamble size must match the address family.
pub fn write_preamble(
    buf: &mut [u8],
    preamble_size: usize,
    conn_id: u16,
    remote_ip: IpAddr,
    remote_port: u16,
    packet_len: usize,
) -> Result<(), UdpgwError> {
    let addr_len = match remote_ip {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    };
    if preamble_size != 7 + addr_len {
        return Err(UdpgwError::BadFrame("preamble size mismatch"));
    }
    if buf.len() < preamble_size {
        return Err(UdpgwError::BadFrame("preamble buffer too small"));
    }
    let size = preamble_size - 2 + packet_len;
    if size > u16::MAX as usize {
        return Err(UdpgwError::BadFrame("oversized packet"));
    }

    buf[0..2].copy_from_slice(&(size as u16).to_le_bytes());
    buf[3..5].copy_from_slice(&conn_id.to_le_bytes());
    match remote_ip {
        IpAddr::V4(ip) => {
            buf[2] = FrameFlags::empty().bits();
            buf[5..9].copy_from_slice(&ip.octets());
            buf[9..11].copy_from_slice(&remote_port.to_le_bytes());
        }
        IpAddr::V6(ip) => {
            buf[2] = FrameFlags::IPV6.bits();
            buf[5..21].copy_from_slice(&ip.octets());
            buf[21..23].copy_from_slice(&remote_port.to_le_bytes());
        }
    }
    Ok(())
}

/// Reads frames off a reliable channel into a reused scratch buffer,
/// consuming keepalives along the way.
pub struct FrameReader {
    buf: Vec<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; MAX_MESSAGE],
        }
    }

    pub async fn next(&mut self, conn: &dyn TunnelConn) -> Result<UdpgwMessage<'_>, UdpgwError> {
        let size = loop {
            let mut size_buf = [0u8; 2];
            read_exact(conn, &mut size_buf).await?;
            let size = u16::from_le_bytes(size_buf) as usize;
            if size > self.buf.len() - 2 {
                return Err(UdpgwError::BadFrame("oversized frame"));
            }
            if size < 3 {
                return Err(UdpgwError::BadFrame("frame too short"));
            }
            read_exact(conn, &mut self.buf[2..2 + size]).await?;

            if FrameFlags::from_bits_retain(self.buf[2]).contains(FrameFlags::KEEPALIVE) {
                continue;
            }
            break size;
        };

        match parse_frame(&self.buf[2..2 + size])? {
            Some(message) => Ok(message),
            None => Err(UdpgwError::BadFrame("unconsumed keepalive")),
        }
    }
}

pub(crate) async fn read_exact(conn: &dyn TunnelConn, buf: &mut [u8]) -> Result<(), UdpgwError> {
    let mut read = 0;
    while read < buf.len() {
        let n = conn.read(&mut buf[read..]).await?;
        if n == 0 {
            return Err(UdpgwError::ChannelClosed);
        }
        read += n;
    }
    Ok(())
}
