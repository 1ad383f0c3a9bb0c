use std::{fmt, net::IpAddr};

use crate::record::{PacketRecord, Transport, PROTO_TCP, PROTO_UDP};

/// Five-tuple identity of a flow within one capture window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub protocol_id: u8,
}

impl FlowKey {
    pub fn rev(&self) -> Self {
        Self {
            source_ip: self.dest_ip,
            dest_ip: self.source_ip,
            source_port: self.dest_port,
            dest_port: self.source_port,
            protocol_id: self.protocol_id,
        }
    }

    /// Orders the two endpoints so that A->B and B->A map to the same key.
    pub fn canonical(self) -> Self {
        if (self.source_ip, self.source_port) <= (self.dest_ip, self.dest_port) {
            self
        } else {
            self.rev()
        }
    }
}

fn write_endpoint(f: &mut fmt::Formatter<'_>, ip: IpAddr, port: u16) -> fmt::Result {
    match ip {
        IpAddr::V4(ip) => write!(f, "{ip}:{port}"),
        IpAddr::V6(ip) => write!(f, "[{ip}]:{port}"),
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_endpoint(f, self.source_ip, self.source_port)?;
        f.write_str(" -> ")?;
        write_endpoint(f, self.dest_ip, self.dest_port)?;
        write!(f, " proto {}", self.protocol_id)
    }
}

/// How packets travelling in opposite directions relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionMode {
    /// Every orientation is its own flow; all packets count as forward.
    SingleDirection,
    /// Both orientations share one flow; forward is whatever direction the
    /// first packet travelled.
    InferByFirstPacketIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    InvalidTimestamp,
    MissingIp,
    MissingProtocol,
    MissingTransport,
    NotTcp,
    ProtocolMismatch,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidTimestamp => "invalid timestamp",
            RejectReason::MissingIp => "missing ip layer",
            RejectReason::MissingProtocol => "missing protocol",
            RejectReason::MissingTransport => "missing transport layer",
            RejectReason::NotTcp => "not tcp",
            RejectReason::ProtocolMismatch => "protocol does not match transport",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Accepted(FlowKey),
    Rejected(RejectReason),
}

/// Number of packets turned away at ingestion, by reason.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RejectCounts {
    pub invalid_timestamp: usize,
    pub missing_ip: usize,
    pub missing_protocol: usize,
    pub missing_transport: usize,
    pub not_tcp: usize,
    pub protocol_mismatch: usize,
}

impl RejectCounts {
    pub fn record(&mut self, reason: RejectReason) {
        let slot = match reason {
            RejectReason::InvalidTimestamp => &mut self.invalid_timestamp,
            RejectReason::MissingIp => &mut self.missing_ip,
            RejectReason::MissingProtocol => &mut self.missing_protocol,
            RejectReason::MissingTransport => &mut self.missing_transport,
            RejectReason::NotTcp => &mut self.not_tcp,
            RejectReason::ProtocolMismatch => &mut self.protocol_mismatch,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.invalid_timestamp
            + self.missing_ip
            + self.missing_protocol
            + self.missing_transport
            + self.not_tcp
            + self.protocol_mismatch
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Keyer {
    direction: DirectionMode,
    require_tcp: bool,
}

impl Keyer {
    pub fn new(direction: DirectionMode, require_tcp: bool) -> Self {
        Self {
            direction,
            require_tcp,
        }
    }

    pub fn direction(&self) -> DirectionMode {
        self.direction
    }

    pub fn key(&self, packet: &PacketRecord) -> KeyOutcome {
        use KeyOutcome::Rejected;

        if !packet.timestamp.is_finite() {
            return Rejected(RejectReason::InvalidTimestamp);
        }
        let (source_ip, dest_ip) = match (packet.source_ip, packet.dest_ip) {
            (Some(src), Some(dst)) => (src, dst),
            _ => return Rejected(RejectReason::MissingIp),
        };
        let transport = match packet.transport {
            Some(transport) => transport,
            None => return Rejected(RejectReason::MissingTransport),
        };
        if self.require_tcp && !matches!(transport, Transport::Tcp { .. }) {
            return Rejected(RejectReason::NotTcp);
        }
        let expected = match transport {
            Transport::Tcp { .. } => PROTO_TCP,
            Transport::Udp { .. } => PROTO_UDP,
        };
        let protocol_id = match packet.protocol_id {
            Some(proto) if proto == expected => proto,
            // an outer header's protocol paired with an inner transport
            Some(_) => return Rejected(RejectReason::ProtocolMismatch),
            // tshark sometimes drops ip.proto on truncated frames; the tcp
            // layer is enough to know it.
            None if expected == PROTO_TCP => PROTO_TCP,
            None => return Rejected(RejectReason::MissingProtocol),
        };

        let (source_port, dest_port) = transport.ports();
        let key = FlowKey {
            source_ip,
            dest_ip,
            source_port,
            dest_port,
            protocol_id,
        };
        KeyOutcome::Accepted(match self.direction {
            DirectionMode::SingleDirection => key,
            DirectionMode::InferByFirstPacketIp => key.canonical(),
        })
    }
}
