//! Groups one capture window's packets into flows.

use std::fmt;

use ahash::RandomState;
use indexmap::IndexMap;
use tracing::trace;

use crate::{
    key::{FlowKey, KeyOutcome, Keyer, RejectCounts},
    record::PacketRecord,
};

/// Fewer packets than this cannot yield duration or inter-arrival statistics.
pub const MIN_FLOW_PACKETS: usize = 2;

// insertion order keeps the output in first-seen order
type FlowMap = IndexMap<FlowKey, Vec<PacketRecord>, RandomState>;

/// A finalized flow: at least [`MIN_FLOW_PACKETS`] packets, sorted by
/// timestamp with ties kept in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    key: FlowKey,
    packets: Vec<PacketRecord>,
}

impl Flow {
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn packets(&self) -> &[PacketRecord] {
        &self.packets
    }

    pub fn first(&self) -> &PacketRecord {
        &self.packets[0]
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn stream_id(&self) -> Option<u64> {
        self.first().stream_id
    }

    pub fn timestamps(&self) -> impl Iterator<Item = f64> + '_ {
        self.packets.iter().map(|p| p.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TooFewPackets(usize),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::TooFewPackets(n) => write!(f, "only {n} packet(s)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Flow(Flow),
    Dropped { key: FlowKey, reason: DropReason },
}

impl Assembled {
    fn finalize(key: FlowKey, mut packets: Vec<PacketRecord>) -> Self {
        if packets.len() < MIN_FLOW_PACKETS {
            return Assembled::Dropped {
                key,
                reason: DropReason::TooFewPackets(packets.len()),
            };
        }
        // `sort_by` is stable, and the keyer already rejected non-finite
        // timestamps.
        packets.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Assembled::Flow(Flow { key, packets })
    }
}

/// Result of assembling one window.
#[derive(Debug, Default, Clone)]
pub struct Assembly {
    pub flows: Vec<Flow>,
    pub dropped: Vec<(FlowKey, DropReason)>,
    pub rejected: RejectCounts,
    pub accepted: usize,
}

pub struct Assembler {
    keyer: Keyer,
    flows: FlowMap,
    rejected: RejectCounts,
    accepted: usize,
}

impl Assembler {
    pub fn new(keyer: Keyer) -> Self {
        Self {
            keyer,
            flows: FlowMap::with_hasher(RandomState::new()),
            rejected: RejectCounts::default(),
            accepted: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, packet: PacketRecord) -> KeyOutcome {
        let outcome = self.keyer.key(&packet);
        match outcome {
            KeyOutcome::Accepted(key) => {
                self.accepted += 1;
                self.flows.entry(key).or_default().push(packet);
            }
            KeyOutcome::Rejected(reason) => {
                trace!(%reason, ts = packet.timestamp, "packet rejected");
                self.rejected.record(reason);
            }
        }
        outcome
    }

    pub fn finish(self) -> Assembly {
        let mut assembly = Assembly {
            rejected: self.rejected,
            accepted: self.accepted,
            ..Default::default()
        };
        for (key, packets) in self.flows {
            match Assembled::finalize(key, packets) {
                Assembled::Flow(flow) => assembly.flows.push(flow),
                Assembled::Dropped { key, reason } => assembly.dropped.push((key, reason)),
            }
        }
        assembly
    }
}

pub fn assemble<I>(keyer: Keyer, packets: I) -> Assembly
where
    I: IntoIterator<Item = PacketRecord>,
{
    let mut assembler = Assembler::new(keyer);
    for packet in packets {
        assembler.push(packet);
    }
    assembler.finish()
}
