//! # Estimators & Statistics
//!
//! The two path estimators that drive FEC budgeting — windowed loss and
//! smoothed one-way delay — plus the serializable counter set an embedder
//! can export.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Closed-group contributions the loss window holds; sized so the window
/// spans roughly one RTT worth of groups.
const LOSS_WINDOW_GROUPS: usize = 32;

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&alpha));
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

// ─── Loss Estimator ─────────────────────────────────────────────────────────

/// Windowed loss estimate over the most recent closed-group reports.
///
/// The estimate the planner consumes comes from the *remote* endpoint's
/// pongs (the receiver's view of the forward path); `min_loss` floors the
/// result so redundancy never collapses during a quiet window, and an
/// endpoint that never hears a pong keeps reporting the floor.
pub struct LossEstimator {
    window: VecDeque<(u64, u64)>,
    min_loss: f64,
}

impl LossEstimator {
    pub fn new(min_loss: f64) -> Self {
        LossEstimator {
            window: VecDeque::with_capacity(LOSS_WINDOW_GROUPS),
            min_loss,
        }
    }

    /// Record one pong contribution: `seen` of `count` originals arrived.
    pub fn record(&mut self, seen: u64, count: u64) {
        if count == 0 {
            return;
        }
        if self.window.len() == LOSS_WINDOW_GROUPS {
            self.window.pop_front();
        }
        self.window.push_back((seen.min(count), count));
    }

    /// Current loss estimate, floored at `min_loss`.
    pub fn estimate(&self) -> f64 {
        let (seen, count) = self
            .window
            .iter()
            .fold((0u64, 0u64), |(s, c), &(ws, wc)| (s + ws, c + wc));
        if count == 0 {
            return self.min_loss;
        }
        (1.0 - seen as f64 / count as f64).max(self.min_loss)
    }

    /// Number of contributions currently in the window.
    pub fn samples(&self) -> usize {
        self.window.len()
    }
}

// ─── Delay Estimator ────────────────────────────────────────────────────────

/// Smoothed one-way delay from pong-measured RTT samples.
///
/// Half of each RTT sample feeds an EWMA with weight 1/8; reads clamp into
/// `[min_delay, max_delay]`, and before the first sample the estimator
/// reports the clamp floor.
pub struct DelayEstimator {
    smoothed_ms: Ewma,
    min_delay: Duration,
    max_delay: Duration,
}

impl DelayEstimator {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        DelayEstimator {
            smoothed_ms: Ewma::new(1.0 / 8.0),
            min_delay,
            max_delay,
        }
    }

    /// Feed one round-trip sample.
    pub fn record_rtt(&mut self, rtt: Duration) {
        self.smoothed_ms.update(rtt.as_secs_f64() * 1000.0 / 2.0);
    }

    /// Clamped smoothed one-way delay.
    pub fn clamped(&self) -> Duration {
        if !self.smoothed_ms.is_initialized() {
            return self.min_delay;
        }
        let ms = self.smoothed_ms.value();
        Duration::from_secs_f64(ms.max(0.0) / 1000.0).clamp(self.min_delay, self.max_delay)
    }

    /// Clamped estimate in whole milliseconds, for telemetry.
    pub fn delay_ms(&self) -> u32 {
        self.clamped().as_millis() as u32
    }
}

// ─── Endpoint Counters ──────────────────────────────────────────────────────

/// Aggregate endpoint statistics, designed for JSON export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    /// Encrypted datagrams handed to the transport.
    pub datagrams_sent: u64,
    /// Application payload bytes sent as originals.
    pub bytes_sent: u64,
    /// Original symbols emitted.
    pub originals_sent: u64,
    /// Recovery symbols emitted.
    pub recovery_sent: u64,
    /// Recovery symbols dropped because the next group closed first.
    pub recovery_dropped: u64,
    /// Code groups closed on the send side.
    pub groups_closed: u64,
    /// Recovery count the planner chose at the latest group close.
    pub recovery_planned_last: u32,
    /// OOB packets sent (pongs excluded).
    pub oob_sent: u64,
    /// Pongs sent.
    pub pongs_sent: u64,

    /// Datagrams handed to `recv`.
    pub datagrams_received: u64,
    /// Envelopes dropped for failed authentication or replay.
    pub auth_failures: u64,
    /// Original symbols accepted.
    pub originals_received: u64,
    /// Recovery symbols accepted.
    pub recovery_received: u64,
    /// Duplicate symbols dropped.
    pub duplicates: u64,
    /// Symbols for groups beyond the ring window.
    pub stale_symbols: u64,
    /// Symbols for groups already closed.
    pub late_symbols: u64,
    /// Structurally invalid plaintexts dropped.
    pub malformed: u64,
    /// Originals reconstructed by the erasure decoder.
    pub recovered_delivered: u64,
    /// Groups where the decoder declined despite enough symbols.
    pub decode_failures: u64,
    /// OOB packets delivered upward (pongs excluded).
    pub oob_received: u64,
    /// Pongs received.
    pub pongs_received: u64,
    /// Most recent pong-measured RTT in milliseconds.
    pub last_rtt_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── EWMA ───────────────────────────────────────────────────────────

    #[test]
    fn ewma_first_sample_sets_value() {
        let mut ewma = Ewma::new(0.125);
        ewma.update(100.0);
        assert_eq!(ewma.value(), 100.0);
    }

    #[test]
    fn ewma_smooths_toward_new_value() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        let v = ewma.update(200.0);
        assert!((v - 150.0).abs() < 1e-9);
    }

    // ─── Loss Estimator ─────────────────────────────────────────────────

    #[test]
    fn empty_window_reports_floor() {
        let est = LossEstimator::new(0.03);
        assert_eq!(est.estimate(), 0.03);
    }

    #[test]
    fn loss_floor_applies_when_quiet() {
        let mut est = LossEstimator::new(0.03);
        est.record(100, 100);
        assert_eq!(est.estimate(), 0.03, "lossless window still reports floor");
    }

    #[test]
    fn loss_tracks_window() {
        let mut est = LossEstimator::new(0.0);
        est.record(90, 100);
        est.record(95, 100);
        assert!((est.estimate() - 0.075).abs() < 1e-9);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut est = LossEstimator::new(0.0);
        // Old heavy-loss entry slides out once the window fills.
        est.record(0, 100);
        for _ in 0..LOSS_WINDOW_GROUPS {
            est.record(100, 100);
        }
        assert_eq!(est.samples(), LOSS_WINDOW_GROUPS);
        assert_eq!(est.estimate(), 0.0);
    }

    #[test]
    fn zero_count_contribution_ignored() {
        let mut est = LossEstimator::new(0.01);
        est.record(0, 0);
        assert_eq!(est.samples(), 0);
    }

    #[test]
    fn seen_clamped_to_count() {
        let mut est = LossEstimator::new(0.0);
        est.record(120, 100); // duplicate-inflated report
        assert_eq!(est.estimate(), 0.0);
    }

    // ─── Delay Estimator ────────────────────────────────────────────────

    #[test]
    fn delay_reports_floor_before_first_sample() {
        let est = DelayEstimator::new(Duration::from_millis(100), Duration::from_millis(2000));
        assert_eq!(est.clamped(), Duration::from_millis(100));
    }

    #[test]
    fn delay_is_half_rtt() {
        let mut est = DelayEstimator::new(Duration::from_millis(1), Duration::from_millis(2000));
        est.record_rtt(Duration::from_millis(300));
        assert_eq!(est.delay_ms(), 150);
    }

    #[test]
    fn delay_clamps_both_ends() {
        let mut est = DelayEstimator::new(Duration::from_millis(100), Duration::from_millis(200));
        est.record_rtt(Duration::from_millis(10));
        assert_eq!(est.clamped(), Duration::from_millis(100));

        let mut est = DelayEstimator::new(Duration::from_millis(10), Duration::from_millis(200));
        est.record_rtt(Duration::from_secs(10));
        assert_eq!(est.clamped(), Duration::from_millis(200));
    }

    #[test]
    fn delay_converges_with_one_eighth_weight() {
        let mut est = DelayEstimator::new(Duration::from_millis(1), Duration::from_secs(10));
        est.record_rtt(Duration::from_millis(60)); // est = 30 ms
        est.record_rtt(Duration::from_millis(600)); // sample = 300 ms
        // 30 + (300 - 30) / 8 = 63.75 ms
        assert_eq!(est.delay_ms(), 63);
    }

    // ─── Counters ───────────────────────────────────────────────────────

    #[test]
    fn stats_serialize_to_json() {
        let mut stats = EndpointStats::default();
        stats.originals_sent = 42;
        stats.auth_failures = 3;
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"originals_sent\":42"));
        assert!(json.contains("\"auth_failures\":3"));
    }
}
