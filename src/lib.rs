//! Flow assembly and feature extraction for classifying captured traffic.
//!
//! A capture window of decoded packets goes through [`key::Keyer`] and
//! [`assemble::assemble`] into flows, each flow becomes a
//! [`features::FeatureVector`], and the resulting [`batch::FeatureBatch`] is
//! handed to a [`classify::Classifier`]. [`cycle::CaptureCycle`] repeats that
//! for as long as the process runs.

pub mod alert;
pub mod assemble;
pub mod batch;
pub mod capture;
pub mod classify;
pub mod cli;
pub mod cycle;
pub mod features;
pub mod key;
pub mod metrics;
pub mod record;
pub mod timing;
pub mod tshark;

pub use assemble::{assemble, Assembled, Assembly, DropReason, Flow};
pub use features::{extract, ExtractConfig, Feature, FeatureVector, Schema};
pub use key::{DirectionMode, FlowKey, KeyOutcome, Keyer, RejectReason};
pub use record::{PacketRecord, TcpFlags, Transport};
pub use timing::TimingStats;
