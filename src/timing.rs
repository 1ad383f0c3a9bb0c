//! Inter-arrival timing and active/idle segmentation of a flow.

/// Default gap, in seconds, above which an inter-arrival interval is idle.
pub const DEFAULT_IDLE_THRESHOLD: f64 = 1.0;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TimingStats {
    /// Mean inter-arrival interval, seconds.
    pub iat_mean: f64,
    /// Mean length of an active period, seconds.
    pub active_mean: f64,
    /// Mean idle interval, seconds.
    pub idle_mean: f64,
    /// Number of intervals at or below the threshold.
    pub active_intervals: usize,
    /// Number of intervals above the threshold.
    pub idle_intervals: usize,
    /// Closed active periods, in order.
    pub active_periods: Vec<f64>,
}

fn mean(sum: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

impl TimingStats {
    /// `timestamps` must already be in ascending order. Fewer than two
    /// timestamps give all-zero statistics.
    pub fn segment<I>(timestamps: I, idle_threshold: f64) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut stats = TimingStats::default();
        let mut iat_sum = 0.0;
        let mut idle_sum = 0.0;
        let mut active = 0.0;

        let mut timestamps = timestamps.into_iter();
        let mut prev = match timestamps.next() {
            Some(ts) => ts,
            None => return stats,
        };
        for ts in timestamps {
            let iat = ts - prev;
            prev = ts;
            iat_sum += iat;

            if iat > idle_threshold {
                stats.idle_intervals += 1;
                idle_sum += iat;
                if active != 0.0 {
                    stats.active_periods.push(active);
                    active = 0.0;
                }
            } else {
                stats.active_intervals += 1;
                active += iat;
            }
        }
        if active != 0.0 {
            stats.active_periods.push(active);
        }

        stats.iat_mean = mean(iat_sum, stats.intervals());
        stats.idle_mean = mean(idle_sum, stats.idle_intervals);
        stats.active_mean = mean(stats.active_periods.iter().sum(), stats.active_periods.len());
        stats
    }

    pub fn intervals(&self) -> usize {
        self.active_intervals + self.idle_intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn active_then_idle() {
        let stats = TimingStats::segment([0.0, 0.2, 5.0], 1.0);
        assert_eq!(stats.active_intervals, 1);
        assert_eq!(stats.idle_intervals, 1);
        assert!(close(stats.idle_mean, 4.8));
        assert!(close(stats.active_mean, 0.2));
        assert!(close(stats.iat_mean, 2.5));
    }

    #[test]
    fn two_packets_single_interval() {
        let stats = TimingStats::segment([10.0, 10.5], 1.0);
        assert!(close(stats.iat_mean, 0.5));
        assert!(close(stats.active_mean, 0.5));
        assert_eq!(stats.idle_mean, 0.0);
    }

    #[test]
    fn consecutive_active_intervals_accumulate() {
        // 0.1 + 0.2 | idle 3.0 | 0.3 + 0.4
        let stats = TimingStats::segment([0.0, 0.1, 0.3, 3.3, 3.6, 4.0], 1.0);
        assert_eq!(stats.active_periods.len(), 2);
        assert!(close(stats.active_periods[0], 0.3));
        assert!(close(stats.active_periods[1], 0.7));
        assert!(close(stats.active_mean, 0.5));
        assert!(close(stats.idle_mean, 3.0));
    }

    #[test]
    fn all_idle_has_no_active_period() {
        let stats = TimingStats::segment([0.0, 2.0, 5.0, 9.0], 1.0);
        assert!(stats.active_periods.is_empty());
        assert_eq!(stats.active_mean, 0.0);
        assert!(close(stats.idle_mean, 3.0));
    }

    #[test]
    fn threshold_is_inclusive_for_active() {
        let stats = TimingStats::segment([0.0, 1.0], 1.0);
        assert_eq!(stats.active_intervals, 1);
        assert_eq!(stats.idle_intervals, 0);
    }

    #[test]
    fn equal_timestamps_never_close_a_period() {
        let stats = TimingStats::segment([1.0, 1.0, 1.0], 1.0);
        assert_eq!(stats.active_intervals, 2);
        assert!(stats.active_periods.is_empty());
        assert_eq!(stats.active_mean, 0.0);
        assert_eq!(stats.iat_mean, 0.0);
    }

    #[test]
    fn every_interval_is_classified_once() {
        let ts = [0.0, 0.4, 0.5, 2.0, 2.1, 7.0, 7.0, 7.9];
        for threshold in [0.0, 0.5, 1.0, 10.0] {
            let stats = TimingStats::segment(ts, threshold);
            assert_eq!(stats.intervals(), ts.len() - 1);
            if stats.idle_intervals == 0 {
                assert_eq!(stats.idle_mean, 0.0);
            }
            if stats.active_periods.is_empty() {
                assert_eq!(stats.active_mean, 0.0);
            }
        }
    }

    #[test]
    fn degenerate_inputs_are_zero() {
        assert_eq!(TimingStats::segment([], 1.0), TimingStats::default());
        assert_eq!(TimingStats::segment([4.0], 1.0), TimingStats::default());
    }
}
