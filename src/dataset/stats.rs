//! Trailing-window feature statistics.

use std::collections::VecDeque;

/// Relative size below which an evicted `m2` is rounding residue.
pub(crate) const CANCELLATION: f64 = 64.0 * f64::EPSILON;

/// Bound on the number of samples a [`StatsPack`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsWindow {
    /// Every sample seen so far.
    All,
    /// The last `n` samples (`n >= 1`).
    Trailing(usize),
}

impl StatsWindow {
    pub fn capacity(&self) -> Option<usize> {
        match self {
            StatsWindow::All => None,
            StatsWindow::Trailing(n) => Some(*n),
        }
    }
}

/// Per-feature running mean/variance over a bounded trailing window.
///
/// Welford accumulators support both insertion and eviction, so a full window
/// costs O(features) per push. Variance is the population variance.
#[derive(Debug, Clone)]
pub struct StatsPack {
    window: StatsWindow,
    features: usize,
    ring: VecDeque<Vec<f64>>,
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl StatsPack {
    pub fn new(features: usize, window: StatsWindow) -> Self {
        let ring_capacity = window.capacity().unwrap_or(0);
        Self {
            window,
            features,
            ring: VecDeque::with_capacity(ring_capacity),
            mean: vec![0.0; features],
            m2: vec![0.0; features],
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// True once the trailing window holds `n` samples. Never true for `All`.
    pub fn is_warm(&self) -> bool {
        matches!(self.window.capacity(), Some(n) if self.count >= n)
    }

    pub fn mean(&self, feature: usize) -> f64 {
        self.mean[feature]
    }

    pub fn variance(&self, feature: usize) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2[feature] / self.count as f64).max(0.0)
    }

    pub fn push(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.features);
        if let Some(cap) = self.window.capacity() {
            if self.count >= cap {
                if let Some(old) = self.ring.pop_front() {
                    self.evict(&old);
                }
            }
            self.ring.push_back(values.to_vec());
        }
        self.count += 1;
        let n = self.count as f64;
        for (f, &x) in values.iter().enumerate() {
            let delta = x - self.mean[f];
            self.mean[f] += delta / n;
            self.m2[f] += delta * (x - self.mean[f]);
        }
    }

    /// Remove `values`, already popped from the ring.
    fn evict(&mut self, values: &[f64]) {
        if self.count <= 1 {
            self.count = 0;
            self.mean.iter_mut().for_each(|m| *m = 0.0);
            self.m2.iter_mut().for_each(|m| *m = 0.0);
            return;
        }
        self.count -= 1;
        let n = self.count as f64;
        for (f, &x) in values.iter().enumerate() {
            let before = self.m2[f];
            let delta = x - self.mean[f];
            self.mean[f] -= delta / n;
            self.m2[f] -= delta * (x - self.mean[f]);
            let scale = before.abs().max(n * self.mean[f] * self.mean[f]);
            if delta != 0.0 && self.m2[f] <= CANCELLATION * scale {
                self.rebuild(f);
            }
        }
    }

    /// Exact two-pass mean/m2 of feature `f` over the ring.
    fn rebuild(&mut self, f: usize) {
        let first = match self.ring.front() {
            Some(row) => row[f],
            None => return,
        };
        if self.ring.iter().all(|row| row[f] == first) {
            self.mean[f] = first;
            self.m2[f] = 0.0;
            return;
        }
        let n = self.ring.len() as f64;
        let mean = self.ring.iter().map(|row| row[f]).sum::<f64>() / n;
        self.mean[f] = mean;
        self.m2[f] = self
            .ring
            .iter()
            .map(|row| (row[f] - mean) * (row[f] - mean))
            .sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_unbounded_matches_batch_stats() {
        let mut pack = StatsPack::new(1, StatsWindow::All);
        for x in [1.0, 2.0, 3.0, 4.0] {
            pack.push(&[x]);
        }
        assert_eq!(pack.count(), 4);
        assert!(close(pack.mean(0), 2.5));
        assert!(close(pack.variance(0), 1.25));
        assert!(!pack.is_warm());
    }

    #[test]
    fn test_trailing_window_evicts_oldest() {
        let mut pack = StatsPack::new(2, StatsWindow::Trailing(3));
        for x in [100.0, 1.0, 2.0, 3.0] {
            pack.push(&[x, -x]);
        }
        assert_eq!(pack.count(), 3);
        assert!(pack.is_warm());
        assert!(close(pack.mean(0), 2.0));
        assert!(close(pack.mean(1), -2.0));
        assert!(close(pack.variance(0), 2.0 / 3.0));
    }

    #[test]
    fn test_constant_values_have_exactly_zero_variance() {
        let mut pack = StatsPack::new(1, StatsWindow::Trailing(4));
        for _ in 0..50 {
            pack.push(&[7.25]);
            assert_eq!(pack.variance(0), 0.0);
            assert_eq!(pack.mean(0), 7.25);
        }
    }

    #[test]
    fn test_spike_leaving_window_leaves_no_residual_spread() {
        let mut pack = StatsPack::new(1, StatsWindow::Trailing(4));
        pack.push(&[-1.0e6]);
        pack.push(&[2.5e6]);
        for _ in 0..30 {
            pack.push(&[3.3]);
        }
        assert_eq!(pack.variance(0), 0.0);
        assert_eq!(pack.mean(0), 3.3);
    }

    #[test]
    fn test_rebuild_keeps_real_spread() {
        let mut pack = StatsPack::new(1, StatsWindow::Trailing(3));
        for x in [1.0e9, 10.0, 10.5, 11.0] {
            pack.push(&[x]);
        }
        assert!(close(pack.mean(0), 10.5));
        assert!(close(pack.variance(0), 1.0 / 6.0));
    }

    #[test]
    fn test_window_of_one() {
        let mut pack = StatsPack::new(1, StatsWindow::Trailing(1));
        pack.push(&[5.0]);
        pack.push(&[9.0]);
        assert_eq!(pack.count(), 1);
        assert_eq!(pack.mean(0), 9.0);
        assert_eq!(pack.variance(0), 0.0);
    }
}
