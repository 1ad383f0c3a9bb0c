//! Normalized view of one decoded packet.
//!
//! Decoders (tshark JSON, libpcap + etherparse) fill in whatever layers they
//! found. Missing layers stay `None`; it is the keyer's job to decide whether
//! such a packet can join a flow.

use std::net::IpAddr;

/// IANA protocol number for TCP.
pub const PROTO_TCP: u8 = 6;
/// IANA protocol number for UDP.
pub const PROTO_UDP: u8 = 17;

/// TCP control bits, each present or absent independently.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub const NONE: TcpFlags = TcpFlags {
        syn: false,
        ack: false,
        fin: false,
        rst: false,
        psh: false,
        urg: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

/// Transport-layer fields of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp {
        source_port: u16,
        dest_port: u16,
        flags: TcpFlags,
        window_size: Option<u32>,
    },
    Udp {
        source_port: u16,
        dest_port: u16,
    },
}

impl Transport {
    pub fn ports(&self) -> (u16, u16) {
        match *self {
            Transport::Tcp {
                source_port,
                dest_port,
                ..
            }
            | Transport::Udp {
                source_port,
                dest_port,
            } => (source_port, dest_port),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    /// Seconds since the epoch.
    pub timestamp: f64,
    pub source_ip: Option<IpAddr>,
    pub dest_ip: Option<IpAddr>,
    pub protocol_id: Option<u8>,
    /// Bytes on the wire.
    pub length: u32,
    pub transport: Option<Transport>,
    /// Per-connection identifier assigned by the capture tool.
    pub stream_id: Option<u64>,
}

impl PacketRecord {
    pub fn source_port(&self) -> u16 {
        self.transport.map(|t| t.ports().0).unwrap_or(0)
    }

    pub fn dest_port(&self) -> u16 {
        self.transport.map(|t| t.ports().1).unwrap_or(0)
    }

    /// Empty for anything that is not TCP.
    pub fn tcp_flags(&self) -> TcpFlags {
        match self.transport {
            Some(Transport::Tcp { flags, .. }) => flags,
            _ => TcpFlags::NONE,
        }
    }

    /// Advertised TCP window, 0 when absent.
    pub fn window_size(&self) -> u32 {
        match self.transport {
            Some(Transport::Tcp { window_size, .. }) => window_size.unwrap_or(0),
            _ => 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A TCP packet with every layer present.
    pub fn tcp(
        timestamp: f64,
        src: &str,
        sport: u16,
        dst: &str,
        dport: u16,
        length: u32,
        flags: TcpFlags,
    ) -> PacketRecord {
        PacketRecord {
            timestamp,
            source_ip: Some(src.parse().unwrap()),
            dest_ip: Some(dst.parse().unwrap()),
            protocol_id: Some(PROTO_TCP),
            length,
            transport: Some(Transport::Tcp {
                source_port: sport,
                dest_port: dport,
                flags,
                window_size: Some(8192),
            }),
            stream_id: Some(0),
        }
    }

    pub fn syn() -> TcpFlags {
        TcpFlags {
            syn: true,
            ..TcpFlags::NONE
        }
    }

    pub fn ack() -> TcpFlags {
        TcpFlags {
            ack: true,
            ..TcpFlags::NONE
        }
    }
}
