//! Online estimators for the rate sampler and latency summaries.

use crate::model::LatencyStats;
use hdrhistogram::Histogram;
use std::time::Duration;

/// Fast mean/variance with a moving window, after Welford, B. P. (1962),
/// "Note on a Method for Calculating Corrected Sums of Squares and Products",
/// Technometrics 4(3).
///
/// The estimator takes two inputs per sampling tick: the cumulative global
/// average rate (bytes/second since the direction started) and the byte delta
/// of the latest tick. Internally both are kept in bytes-per-period so the
/// two streams share a unit. The global-average stream drives the classical
/// Welford mean/variance update with in-place window replacement; the delta
/// stream drives the EWMA and the window arithmetic mean. The published rate
/// is the 50/50 blend of the two delta-side estimates.
pub struct Welford {
    cap: usize,
    beta: f64,
    unit_scale: f64,
    n: usize,
    erase_index: usize,
    avg_ring: Vec<f64>,
    delta_ring: Vec<f64>,
    delta_sum: f64,
    mean: f64,
    sum: f64,
    cv: f64,
    ewma: f64,
    steps: usize,
    stable: usize,
}

/// Coefficient-of-variation bound under which a tick counts as stable.
const STABLE_CV: f64 = 0.03;

impl Welford {
    /// Window capacity is `window / period`; the stability threshold is a
    /// third of it and the minimum-steps gate is twice it.
    pub fn new(window: Duration, period: Duration) -> Self {
        let cap = (window.as_nanos() / period.as_nanos()).max(1) as usize;
        Self {
            cap,
            beta: 2.0 / (cap as f64 + 1.0),
            unit_scale: 1.0 / period.as_secs_f64(),
            n: 0,
            erase_index: 0,
            avg_ring: vec![0.0; cap],
            delta_ring: vec![0.0; cap],
            delta_sum: 0.0,
            mean: 0.0,
            sum: 0.0,
            cv: 0.0,
            ewma: 0.0,
            steps: 0,
            stable: 0,
        }
    }

    /// Enter one sampling tick into the measuring system.
    ///
    /// `global_avg` is total bytes over elapsed time in bytes/second;
    /// `delta` is the byte count of the latest period. Returns the stability
    /// verdict: true once the direction can stop early.
    pub fn update(&mut self, global_avg: f64, delta: f64) -> bool {
        let value = global_avg / self.unit_scale;
        self.steps += 1;

        if self.n == self.cap {
            let old = self.avg_ring[self.erase_index];
            let d = old - self.mean;
            self.mean -= d / (self.n - 1) as f64;
            self.sum -= d * (old - self.mean);
            // the calc error is approximated to zero
            if self.sum < 0.0 {
                self.sum = 0.0;
            }
            self.avg_ring[self.erase_index] = value;
            self.delta_sum += delta - self.delta_ring[self.erase_index];
            self.delta_ring[self.erase_index] = delta;
            self.erase_index += 1;
            if self.erase_index == self.cap {
                self.erase_index = 0;
            }
        } else {
            self.avg_ring[self.n] = value;
            self.delta_ring[self.n] = delta;
            self.delta_sum += delta;
            self.n += 1;
        }

        let d = value - self.mean;
        self.mean += d / self.n as f64;
        self.sum += d * (value - self.mean);

        self.cv = if self.mean == 0.0 {
            1.0
        } else {
            (self.variance().sqrt() / self.mean).min(1.0)
        };

        self.ewma = self.beta * delta + (1.0 - self.beta) * self.ewma;

        // Stability only starts accruing past the minimum-steps gate, and an
        // isolated stable tick is undone by the next unstable one.
        if self.steps > 2 * self.cap {
            if self.cv < STABLE_CV {
                self.stable += 1;
            } else {
                self.stable = self.stable.saturating_sub(1);
            }
        }
        self.stable >= self.stable_threshold()
    }

    fn stable_threshold(&self) -> usize {
        (self.cap / 3).max(1)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        self.sum / (self.n - 1) as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn cv(&self) -> f64 {
        self.cv
    }

    /// Current rate estimate in bytes/second: the EWMA of per-period deltas
    /// blended 50/50 with the window arithmetic mean.
    pub fn rate(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        0.5 * (self.ewma + self.delta_sum / self.n as f64) * self.unit_scale
    }
}

/// Summarise a raw nanosecond sample vector: mean, jitter (sample standard
/// deviation), min, max, and the usual percentiles.
pub fn latency_stats(samples: &[i64]) -> Option<LatencyStats> {
    if samples.is_empty() {
        return None;
    }

    let n = samples.len() as f64;
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n;
    let jitter = if samples.len() < 2 {
        0.0
    } else {
        let ss = samples
            .iter()
            .map(|&s| {
                let d = s as f64 - mean;
                d * d
            })
            .sum::<f64>();
        (ss / (n - 1.0)).sqrt()
    };

    // hdrhistogram wants positive integers; clamp into one-minute bounds.
    let mut hist = Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3).unwrap();
    for &s in samples {
        let _ = hist.record(s.max(1) as u64);
    }

    Some(LatencyStats {
        mean_ns: mean.round() as i64,
        jitter_ns: jitter.round() as i64,
        min_ns: *samples.iter().min().unwrap(),
        max_ns: *samples.iter().max().unwrap(),
        p50_ns: hist.value_at_quantile(0.50) as i64,
        p90_ns: hist.value_at_quantile(0.90) as i64,
        p99_ns: hist.value_at_quantile(0.99) as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn welford_c9() -> Welford {
        // window 450ms / period 50ms -> capacity 9, threshold 3, gate 18
        Welford::new(Duration::from_millis(450), Duration::from_millis(50))
    }

    #[test]
    fn constant_stream_variance_is_zero() {
        let mut w = welford_c9();
        for _ in 0..30 {
            w.update(4_000_000.0, 200_000.0);
        }
        assert!(w.variance().abs() < 1e-9);
        assert!(w.cv() < 1e-9);
    }

    #[test]
    fn constant_stream_converges_at_exact_tick() {
        let mut w = welford_c9();
        // convergence lands on tick 2C + C/3 = 21
        for tick in 1..=20 {
            assert!(!w.update(4_000_000.0, 200_000.0), "converged early at {tick}");
        }
        assert!(w.update(4_000_000.0, 200_000.0));
    }

    #[test]
    fn zero_stream_never_stabilises() {
        let mut w = welford_c9();
        for _ in 0..100 {
            assert!(!w.update(0.0, 0.0));
        }
        assert_eq!(w.rate(), 0.0);
        assert_eq!(w.cv(), 1.0);
    }

    #[test]
    fn rate_blends_to_input_on_steady_stream() {
        // 200_000 bytes per 50ms tick = 4 MB/s; after plenty of ticks both
        // the EWMA and the window mean sit on the same figure
        let mut w = welford_c9();
        for _ in 0..200 {
            w.update(4_000_000.0, 200_000.0);
        }
        let rate = w.rate();
        assert!((rate - 4_000_000.0).abs() / 4_000_000.0 < 0.01, "rate={rate}");
    }

    #[test]
    fn window_replacement_tracks_recent_mean() {
        let mut w = welford_c9();
        for _ in 0..9 {
            w.update(1_000_000.0, 50_000.0);
        }
        // shift to a new level; after a full window the mean should follow
        for _ in 0..9 {
            w.update(8_000_000.0, 400_000.0);
        }
        let stored_mean = w.mean();
        // stored values are bytes-per-period (50ms), 8 MB/s -> 400_000
        assert!((stored_mean - 400_000.0).abs() < 1.0, "mean={stored_mean}");
    }

    #[test]
    fn unstable_ticks_decrement_the_counter() {
        let mut w = welford_c9();
        // past the gate, alternate stable and wildly unstable global averages
        for _ in 0..18 {
            w.update(4_000_000.0, 200_000.0);
        }
        let mut converged = false;
        for i in 0..30 {
            let avg = if i % 2 == 0 { 4_000_000.0 } else { 40_000_000.0 };
            converged |= w.update(avg, 200_000.0);
        }
        assert!(!converged, "oscillating stream must not converge");
    }

    #[test]
    fn latency_stats_basics() {
        let samples = vec![4_000_000i64, 5_000_000, 6_000_000];
        let stats = latency_stats(&samples).unwrap();
        assert_eq!(stats.mean_ns, 5_000_000);
        assert_eq!(stats.min_ns, 4_000_000);
        assert_eq!(stats.max_ns, 6_000_000);
        assert_eq!(stats.jitter_ns, 1_000_000);
        assert!(stats.p50_ns >= stats.min_ns && stats.p50_ns <= stats.max_ns);
    }

    #[test]
    fn latency_stats_empty_is_none() {
        assert!(latency_stats(&[]).is_none());
    }
}
