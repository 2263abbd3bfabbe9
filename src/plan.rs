//! # Redundancy Planner
//!
//! Maps (loss estimate, group size, target residual loss) to a recovery
//! count: the smallest `r` such that losing more than `r` of the group's
//! `k + r` symbols — the only event FEC cannot repair — has probability at
//! most the target, assuming independent per-packet loss.
//!
//! The upper binomial tail is evaluated exactly in log space against a
//! precomputed ln-factorial table; one evaluation per candidate `r`, one
//! planning call per group close.

use crate::codec::{GROUP_ORIGINAL_LIMIT, GROUP_RECOVERY_LIMIT};

/// Largest symbol count a group may reach (`k + r`), bounded by the
/// coefficient index space of the erasure code.
const GROUP_SYMBOL_SPACE: usize = 255;

/// Loss probabilities above this are treated as this; the planner's job is
/// sizing redundancy, not surviving a dead link.
const PLANNER_LOSS_CEILING: f64 = 0.5;

/// Chooses recovery counts from the binomial loss model.
pub struct RedundancyPlanner {
    ln_factorial: Vec<f64>,
}

impl RedundancyPlanner {
    pub fn new() -> Self {
        let mut ln_factorial = vec![0.0f64; GROUP_SYMBOL_SPACE + 1];
        for n in 1..=GROUP_SYMBOL_SPACE {
            ln_factorial[n] = ln_factorial[n - 1] + (n as f64).ln();
        }
        RedundancyPlanner { ln_factorial }
    }

    /// Smallest `r` with `P[more than r of (k + r) packets lost] <= target`,
    /// clamped to the group limits. Returns 0 when the loss estimate is
    /// already within target, or when the group is empty.
    pub fn recovery_count(&self, loss: f64, original_count: usize, target_loss: f64) -> usize {
        let k = original_count.min(GROUP_ORIGINAL_LIMIT);
        if k == 0 {
            return 0;
        }
        let p = loss.clamp(0.0, PLANNER_LOSS_CEILING);
        if p == 0.0 {
            return 0;
        }

        let max_r = GROUP_RECOVERY_LIMIT.min(GROUP_SYMBOL_SPACE - k);
        for r in 0..=max_r {
            if self.tail_above(k + r, r, p) <= target_loss {
                return r;
            }
        }
        max_r
    }

    /// `P[X > r]` for `X ~ Binomial(n, p)`.
    fn tail_above(&self, n: usize, r: usize, p: f64) -> f64 {
        if r >= n {
            return 0.0;
        }
        let ln_p = p.ln();
        let ln_q = (1.0 - p).ln();
        let mut sum = 0.0;
        for j in (r + 1)..=n {
            let ln_term = self.ln_choose(n, j) + j as f64 * ln_p + (n - j) as f64 * ln_q;
            sum += ln_term.exp();
        }
        sum.min(1.0)
    }

    fn ln_choose(&self, n: usize, j: usize) -> f64 {
        self.ln_factorial[n] - self.ln_factorial[j] - self.ln_factorial[n - j]
    }
}

impl Default for RedundancyPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_loss_needs_no_recovery() {
        let plan = RedundancyPlanner::new();
        assert_eq!(plan.recovery_count(0.0, 32, 1e-4), 0);
        assert_eq!(plan.recovery_count(0.0, 1, 1e-4), 0);
    }

    #[test]
    fn empty_group_needs_no_recovery() {
        let plan = RedundancyPlanner::new();
        assert_eq!(plan.recovery_count(0.2, 0, 1e-4), 0);
    }

    #[test]
    fn single_original_high_loss_gets_recovery() {
        let plan = RedundancyPlanner::new();
        let r = plan.recovery_count(0.3, 1, 1e-4);
        assert!(r >= 1, "k=1 under heavy loss must plan recovery, got {r}");
    }

    #[test]
    fn monotonic_in_loss() {
        let plan = RedundancyPlanner::new();
        let mut prev = 0;
        for loss in [0.005, 0.01, 0.03, 0.05, 0.10, 0.20, 0.30] {
            let r = plan.recovery_count(loss, 64, 1e-4);
            assert!(r >= prev, "r must not shrink as loss grows: {loss} -> {r}");
            prev = r;
        }
    }

    #[test]
    fn monotonic_in_target() {
        let plan = RedundancyPlanner::new();
        let strict = plan.recovery_count(0.05, 64, 1e-6);
        let loose = plan.recovery_count(0.05, 64, 1e-2);
        assert!(strict >= loose);
    }

    #[test]
    fn respects_group_limits() {
        let plan = RedundancyPlanner::new();
        for &(loss, k) in &[(0.5, 1usize), (0.5, 192), (0.49, 100), (0.2, 192)] {
            let r = plan.recovery_count(loss, k, 1e-9);
            assert!(r <= GROUP_RECOVERY_LIMIT);
            assert!(k + r <= 255, "k+r must fit the symbol space");
        }
    }

    #[test]
    fn planned_redundancy_meets_target() {
        let plan = RedundancyPlanner::new();
        for &(loss, k, target) in &[
            (0.05, 100usize, 1e-4),
            (0.01, 32, 1e-4),
            (0.20, 50, 1e-3),
            (0.03, 16, 1e-4),
        ] {
            let r = plan.recovery_count(loss, k, target);
            assert!(
                plan.tail_above(k + r, r, loss) <= target,
                "chosen r={r} misses target for p={loss}, k={k}"
            );
            if r > 0 {
                assert!(
                    plan.tail_above(k + r - 1, r - 1, loss) > target,
                    "r={r} is not minimal for p={loss}, k={k}"
                );
            }
        }
    }

    #[test]
    fn five_percent_loss_plans_sane_overhead() {
        let plan = RedundancyPlanner::new();
        let r = plan.recovery_count(0.05, 100, 1e-4);
        // Mean loss is ~5 packets; the tail bound lands in the teens.
        assert!((8..=25).contains(&r), "unexpected r={r}");
    }

    #[test]
    fn tail_bounds_are_probabilities() {
        let plan = RedundancyPlanner::new();
        for n in [1usize, 10, 100, 255] {
            for r in [0usize, 1, n / 2, n] {
                let t = plan.tail_above(n, r, 0.3);
                assert!((0.0..=1.0).contains(&t));
            }
        }
        assert_eq!(plan.tail_above(10, 10, 0.9), 0.0);
    }
}
