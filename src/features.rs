//! Per-flow feature vectors.
//!
//! Column names follow the CICIDS2017 / CICFlowMeter naming the classifier was
//! trained on. Every column is always computed; the [`Schema`] only decides
//! which of them end up in the submitted table.

use std::fmt;

use crate::{
    assemble::Flow,
    key::DirectionMode,
    timing::{TimingStats, DEFAULT_IDLE_THRESHOLD},
};

const MICROS: f64 = 1e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    SrcPort,
    DstPort,
    Protocol,
    FlowDuration,
    TotFwdPkts,
    TotBwdPkts,
    PktLenMean,
    FlowBytsPerSec,
    FlowPktsPerSec,
    SynFlagCnt,
    InitFwdWinByts,
    AckFlagCnt,
    RstFlagCnt,
    FinFlagCnt,
    PshFlagCnt,
    UrgFlagCnt,
    FlowIatMean,
    ActiveMean,
    IdleMean,
}

impl Feature {
    /// Columns the classifier refuses to run without, in table order.
    pub const REQUIRED: [Feature; 13] = [
        Feature::SrcPort,
        Feature::DstPort,
        Feature::Protocol,
        Feature::FlowDuration,
        Feature::TotFwdPkts,
        Feature::TotBwdPkts,
        Feature::PktLenMean,
        Feature::FlowBytsPerSec,
        Feature::FlowPktsPerSec,
        Feature::SynFlagCnt,
        Feature::InitFwdWinByts,
        Feature::AckFlagCnt,
        Feature::RstFlagCnt,
    ];
    pub const EXTENDED_FLAGS: [Feature; 3] =
        [Feature::FinFlagCnt, Feature::PshFlagCnt, Feature::UrgFlagCnt];
    pub const TIMING: [Feature; 3] = [Feature::FlowIatMean, Feature::ActiveMean, Feature::IdleMean];

    pub const fn name(self) -> &'static str {
        match self {
            Feature::SrcPort => "Src Port",
            Feature::DstPort => "Dst Port",
            Feature::Protocol => "Protocol",
            Feature::FlowDuration => "Flow Duration",
            Feature::TotFwdPkts => "Tot Fwd Pkts",
            Feature::TotBwdPkts => "Tot Bwd Pkts",
            Feature::PktLenMean => "Pkt Len Mean",
            Feature::FlowBytsPerSec => "Flow Byts/s",
            Feature::FlowPktsPerSec => "Flow Pkts/s",
            Feature::SynFlagCnt => "SYN Flag Cnt",
            Feature::InitFwdWinByts => "Init Fwd Win Byts",
            Feature::AckFlagCnt => "ACK Flag Cnt",
            Feature::RstFlagCnt => "RST Flag Cnt",
            Feature::FinFlagCnt => "FIN Flag Cnt",
            Feature::PshFlagCnt => "PSH Flag Cnt",
            Feature::UrgFlagCnt => "URG Flag Cnt",
            Feature::FlowIatMean => "Flow IAT Mean",
            Feature::ActiveMean => "Active Mean",
            Feature::IdleMean => "Idle Mean",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which optional column groups go into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    pub timing: bool,
    pub extended_flags: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            timing: true,
            extended_flags: false,
        }
    }
}

impl Schema {
    pub fn columns(&self) -> Vec<Feature> {
        let mut columns = Feature::REQUIRED.to_vec();
        if self.extended_flags {
            columns.extend(Feature::EXTENDED_FLAGS);
        }
        if self.timing {
            columns.extend(Feature::TIMING);
        }
        columns
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractConfig {
    pub direction: DirectionMode,
    /// Seconds.
    pub idle_threshold: f64,
}

impl ExtractConfig {
    pub fn new(direction: DirectionMode) -> Self {
        Self {
            direction,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

/// Numeric summary of one flow. Time aggregates are in microseconds, like
/// `Flow Duration`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FeatureVector {
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub flow_duration: f64,
    pub tot_fwd_pkts: u64,
    pub tot_bwd_pkts: u64,
    pub pkt_len_mean: f64,
    pub flow_byts_per_sec: f64,
    pub flow_pkts_per_sec: f64,
    pub syn_flag_cnt: u64,
    pub ack_flag_cnt: u64,
    pub rst_flag_cnt: u64,
    pub fin_flag_cnt: u64,
    pub psh_flag_cnt: u64,
    pub urg_flag_cnt: u64,
    pub init_fwd_win_byts: u32,
    pub flow_iat_mean: f64,
    pub active_mean: f64,
    pub idle_mean: f64,
}

impl FeatureVector {
    pub fn get(&self, feature: Feature) -> f64 {
        match feature {
            Feature::SrcPort => self.src_port.into(),
            Feature::DstPort => self.dst_port.into(),
            Feature::Protocol => self.protocol.into(),
            Feature::FlowDuration => self.flow_duration,
            Feature::TotFwdPkts => self.tot_fwd_pkts as f64,
            Feature::TotBwdPkts => self.tot_bwd_pkts as f64,
            Feature::PktLenMean => self.pkt_len_mean,
            Feature::FlowBytsPerSec => self.flow_byts_per_sec,
            Feature::FlowPktsPerSec => self.flow_pkts_per_sec,
            Feature::SynFlagCnt => self.syn_flag_cnt as f64,
            Feature::InitFwdWinByts => self.init_fwd_win_byts.into(),
            Feature::AckFlagCnt => self.ack_flag_cnt as f64,
            Feature::RstFlagCnt => self.rst_flag_cnt as f64,
            Feature::FinFlagCnt => self.fin_flag_cnt as f64,
            Feature::PshFlagCnt => self.psh_flag_cnt as f64,
            Feature::UrgFlagCnt => self.urg_flag_cnt as f64,
            Feature::FlowIatMean => self.flow_iat_mean,
            Feature::ActiveMean => self.active_mean,
            Feature::IdleMean => self.idle_mean,
        }
    }

    pub fn values(&self, schema: &Schema) -> Vec<f64> {
        schema.columns().into_iter().map(|f| self.get(f)).collect()
    }
}

/// `amount` per second over `duration_us`, or 0 for a zero-length flow.
fn rate(amount: f64, duration_us: f64) -> f64 {
    if duration_us > 0.0 {
        amount / (duration_us / MICROS)
    } else {
        0.0
    }
}

pub fn extract(flow: &Flow, config: &ExtractConfig) -> FeatureVector {
    let packets = flow.packets();
    let first = flow.first();
    let last = &packets[packets.len() - 1];
    let count = packets.len() as u64;

    let flow_duration = ((last.timestamp - first.timestamp) * MICROS).max(0.0);
    let total_bytes: u64 = packets.iter().map(|p| u64::from(p.length)).sum();

    let tot_fwd_pkts = match config.direction {
        DirectionMode::SingleDirection => count,
        DirectionMode::InferByFirstPacketIp => packets
            .iter()
            .filter(|p| p.source_ip == first.source_ip)
            .count() as u64,
    };

    let mut fv = FeatureVector {
        src_port: first.source_port(),
        dst_port: first.dest_port(),
        protocol: flow.key().protocol_id,
        flow_duration,
        tot_fwd_pkts,
        tot_bwd_pkts: count - tot_fwd_pkts,
        pkt_len_mean: total_bytes as f64 / count as f64,
        flow_byts_per_sec: rate(total_bytes as f64, flow_duration),
        flow_pkts_per_sec: rate(count as f64, flow_duration),
        init_fwd_win_byts: first.window_size(),
        ..Default::default()
    };

    for flags in packets.iter().map(|p| p.tcp_flags()) {
        fv.syn_flag_cnt += u64::from(flags.syn);
        fv.ack_flag_cnt += u64::from(flags.ack);
        fv.rst_flag_cnt += u64::from(flags.rst);
        fv.fin_flag_cnt += u64::from(flags.fin);
        fv.psh_flag_cnt += u64::from(flags.psh);
        fv.urg_flag_cnt += u64::from(flags.urg);
    }

    let timing = TimingStats::segment(flow.timestamps(), config.idle_threshold);
    fv.flow_iat_mean = timing.iat_mean * MICROS;
    fv.active_mean = timing.active_mean * MICROS;
    fv.idle_mean = timing.idle_mean * MICROS;

    fv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assemble::assemble,
        key::Keyer,
        record::{testing::*, PacketRecord, TcpFlags},
    };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn flows(direction: DirectionMode, packets: Vec<PacketRecord>) -> Vec<Flow> {
        assemble(Keyer::new(direction, true), packets).flows
    }

    fn handshake() -> Vec<PacketRecord> {
        vec![
            tcp(0.0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, syn()),
            tcp(0.5, "10.0.0.1", 1000, "10.0.0.2", 80, 1500, ack()),
        ]
    }

    #[test]
    fn two_packet_scenario() {
        let flows = flows(DirectionMode::SingleDirection, handshake());
        assert_eq!(flows.len(), 1);
        let fv = extract(&flows[0], &ExtractConfig::new(DirectionMode::SingleDirection));

        assert_eq!(fv.src_port, 1000);
        assert_eq!(fv.dst_port, 80);
        assert_eq!(fv.protocol, 6);
        assert_eq!(fv.tot_fwd_pkts, 2);
        assert_eq!(fv.tot_bwd_pkts, 0);
        assert!(close(fv.flow_duration, 500_000.0));
        assert!(close(fv.pkt_len_mean, 780.0));
        assert_eq!(fv.syn_flag_cnt, 1);
        assert_eq!(fv.ack_flag_cnt, 1);
        assert_eq!(fv.rst_flag_cnt, 0);
        assert!(close(fv.flow_byts_per_sec, 3120.0));
        assert!(close(fv.flow_pkts_per_sec, 4.0));
        assert_eq!(fv.init_fwd_win_byts, 8192);
    }

    #[test]
    fn zero_duration_has_zero_rates() {
        let packets = vec![
            tcp(3.0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, syn()),
            tcp(3.0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, ack()),
            tcp(3.0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, ack()),
        ];
        let flows = flows(DirectionMode::SingleDirection, packets);
        let fv = extract(&flows[0], &ExtractConfig::new(DirectionMode::SingleDirection));
        assert_eq!(fv.flow_duration, 0.0);
        assert_eq!(fv.flow_byts_per_sec, 0.0);
        assert_eq!(fv.flow_pkts_per_sec, 0.0);
        assert!(fv.values(&Schema::default()).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn timing_columns_in_microseconds() {
        let packets = vec![
            tcp(0.0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, syn()),
            tcp(0.2, "10.0.0.1", 1000, "10.0.0.2", 80, 60, ack()),
            tcp(5.0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, ack()),
        ];
        let flows = flows(DirectionMode::SingleDirection, packets);
        let fv = extract(&flows[0], &ExtractConfig::new(DirectionMode::SingleDirection));
        assert!(close(fv.idle_mean, 4_800_000.0));
        assert!(close(fv.active_mean, 200_000.0));
        assert!(close(fv.flow_iat_mean, 2_500_000.0));
    }

    #[test]
    fn flag_counts_stay_within_packet_count() {
        let all = TcpFlags {
            syn: true,
            ack: true,
            fin: true,
            rst: true,
            psh: true,
            urg: true,
        };
        let packets = vec![
            tcp(0.0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, all),
            tcp(0.1, "10.0.0.1", 1000, "10.0.0.2", 80, 60, all),
            tcp(0.2, "10.0.0.1", 1000, "10.0.0.2", 80, 60, TcpFlags::NONE),
        ];
        let flows = flows(DirectionMode::SingleDirection, packets);
        let fv = extract(&flows[0], &ExtractConfig::new(DirectionMode::SingleDirection));
        for flag in [
            Feature::SynFlagCnt,
            Feature::AckFlagCnt,
            Feature::RstFlagCnt,
            Feature::FinFlagCnt,
            Feature::PshFlagCnt,
            Feature::UrgFlagCnt,
        ] {
            assert_eq!(fv.get(flag), 2.0, "{flag}");
        }
    }

    #[test]
    fn initial_window_comes_from_first_packet_only() {
        let mut first = tcp(1.0, "10.0.0.1", 1000, "10.0.0.2", 80, 60, syn());
        let mut second = tcp(0.5, "10.0.0.1", 1000, "10.0.0.2", 80, 60, ack());
        if let Some(crate::record::Transport::Tcp { window_size, .. }) = &mut first.transport {
            *window_size = Some(1024);
        }
        if let Some(crate::record::Transport::Tcp { window_size, .. }) = &mut second.transport {
            *window_size = None;
        }
        // `second` is earlier, so it becomes the first packet of the flow.
        let flows = flows(DirectionMode::SingleDirection, vec![first, second]);
        let fv = extract(&flows[0], &ExtractConfig::new(DirectionMode::SingleDirection));
        assert_eq!(fv.init_fwd_win_byts, 0);
    }

    #[test]
    fn inferred_direction_splits_counts() {
        let packets = vec![
            tcp(0.0, "10.0.0.9", 40000, "10.0.0.2", 80, 60, syn()),
            tcp(0.1, "10.0.0.2", 80, "10.0.0.9", 40000, 60, syn()),
            tcp(0.2, "10.0.0.9", 40000, "10.0.0.2", 80, 60, ack()),
            tcp(0.3, "10.0.0.2", 80, "10.0.0.9", 40000, 900, ack()),
            tcp(0.4, "10.0.0.2", 80, "10.0.0.9", 40000, 900, ack()),
        ];
        let config = ExtractConfig::new(DirectionMode::InferByFirstPacketIp);
        let flows = flows(DirectionMode::InferByFirstPacketIp, packets.clone());
        assert_eq!(flows.len(), 1);
        let fv = extract(&flows[0], &config);
        assert_eq!(fv.tot_fwd_pkts, 2);
        assert_eq!(fv.tot_bwd_pkts, 3);
        assert_eq!(fv.src_port, 40000);
        assert_eq!(fv.dst_port, 80);

        // the same traffic, one flow per orientation
        let single = ExtractConfig::new(DirectionMode::SingleDirection);
        let split = self::flows(DirectionMode::SingleDirection, packets);
        assert_eq!(split.len(), 2);
        for flow in &split {
            let fv = extract(flow, &single);
            assert_eq!(fv.tot_bwd_pkts, 0);
            assert_eq!(fv.tot_fwd_pkts, flow.len() as u64);
        }
    }

    #[test]
    fn schema_columns() {
        let names = |schema: Schema| -> Vec<&str> {
            schema.columns().into_iter().map(Feature::name).collect()
        };
        let minimal = names(Schema {
            timing: false,
            extended_flags: false,
        });
        assert_eq!(minimal.len(), 13);
        assert_eq!(minimal[0], "Src Port");
        assert_eq!(minimal[12], "RST Flag Cnt");

        let full = names(Schema {
            timing: true,
            extended_flags: true,
        });
        assert_eq!(full.len(), 19);
        assert_eq!(&full[13..16], &["FIN Flag Cnt", "PSH Flag Cnt", "URG Flag Cnt"]);
        assert_eq!(&full[16..], &["Flow IAT Mean", "Active Mean", "Idle Mean"]);
    }
}
