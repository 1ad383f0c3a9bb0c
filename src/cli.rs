//! Command-line pieces shared by the binaries.

use std::{num::ParseIntError, time::Duration};

use clap::{ArgEnum, Args};
use tracing_subscriber::EnvFilter;

use crate::{
    features::{ExtractConfig, Schema},
    key::DirectionMode,
    timing::DEFAULT_IDLE_THRESHOLD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum)]
pub enum DirectionArg {
    /// each orientation is its own flow, backward count is always 0
    Single,
    /// both orientations share a flow, forward follows the first packet
    Infer,
}

impl From<DirectionArg> for DirectionMode {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Single => DirectionMode::SingleDirection,
            DirectionArg::Infer => DirectionMode::InferByFirstPacketIp,
        }
    }
}

pub fn parse_secs(s: &str) -> Result<Duration, ParseIntError> {
    Ok(Duration::from_secs(s.parse()?))
}

pub fn parse_threshold(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Ok(_) => Err("threshold must be a non-negative number of seconds".into()),
        Err(e) => Err(e.to_string()),
    }
}

#[derive(Debug, Clone, Args)]
pub struct ExtractArgs {
    /// How packets travelling in opposite directions are grouped; must be
    /// chosen per deployment
    #[clap(long, arg_enum)]
    pub direction_mode: DirectionArg,
    /// Inter-arrival gap (seconds) above which the flow counts as idle
    #[clap(long, default_value_t = DEFAULT_IDLE_THRESHOLD, parse(try_from_str = parse_threshold))]
    pub idle_threshold: f64,
    /// Leave the Flow IAT / Active / Idle columns out of the table
    #[clap(long)]
    pub no_timing: bool,
    /// Add FIN, PSH and URG flag counts to the table
    #[clap(long)]
    pub extended_flags: bool,
    /// Accept UDP packets as well as TCP
    #[clap(long)]
    pub allow_udp: bool,
}

impl ExtractArgs {
    pub fn extract_config(&self) -> ExtractConfig {
        ExtractConfig {
            direction: self.direction_mode.into(),
            idle_threshold: self.idle_threshold,
        }
    }

    pub fn schema(&self) -> Schema {
        Schema {
            timing: !self.no_timing,
            extended_flags: self.extended_flags,
        }
    }

    pub fn require_tcp(&self) -> bool {
        !self.allow_udp
    }
}

/// Logs to stderr, filtered by `RUST_LOG` when set.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[clap(flatten)]
        extract: ExtractArgs,
    }

    #[test]
    fn direction_mode_is_required() {
        assert!(Harness::try_parse_from(["test"]).is_err());
    }

    #[test]
    fn defaults() {
        let h = Harness::try_parse_from(["test", "--direction-mode", "single"]).unwrap();
        let config = h.extract.extract_config();
        assert_eq!(config.direction, DirectionMode::SingleDirection);
        assert_eq!(config.idle_threshold, 1.0);
        assert_eq!(h.extract.schema(), Schema::default());
        assert!(h.extract.require_tcp());
    }

    #[test]
    fn overrides() {
        let h = Harness::try_parse_from([
            "test",
            "--direction-mode",
            "infer",
            "--idle-threshold",
            "2.5",
            "--no-timing",
            "--extended-flags",
            "--allow-udp",
        ])
        .unwrap();
        assert_eq!(
            h.extract.extract_config().direction,
            DirectionMode::InferByFirstPacketIp
        );
        assert_eq!(h.extract.idle_threshold, 2.5);
        assert_eq!(
            h.extract.schema(),
            Schema {
                timing: false,
                extended_flags: true
            }
        );
        assert!(!h.extract.require_tcp());
    }

    #[test]
    fn negative_threshold_rejected() {
        assert!(Harness::try_parse_from([
            "test",
            "--direction-mode",
            "single",
            "--idle-threshold=-1"
        ])
        .is_err());
    }

    #[test]
    fn seconds() {
        assert_eq!(parse_secs("15").unwrap(), Duration::from_secs(15));
        assert!(parse_secs("1.5").is_err());
    }
}
