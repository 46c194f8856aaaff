//! Bounded time-indexed buffers
//!
//! A [`TemporalWindow`] keeps `(timestamp, value)` pairs and never retains an
//! entry once it is older than the window horizon. Each signal owns its own
//! window; there is no shared buffer state.

use crate::types::Seconds;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Whether an entry stamped `timestamp` is still inside `horizon` at `now`
pub fn is_retained(now: Seconds, timestamp: Seconds, horizon: Seconds) -> bool {
    now - timestamp < horizon
}

/// Rolling time-series buffer with a fixed horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalWindow<T> {
    entries: VecDeque<(Seconds, T)>,
    horizon: Seconds,
}

impl<T> TemporalWindow<T> {
    /// Create an empty window retaining entries for `horizon` seconds
    pub fn new(horizon: Seconds) -> Self {
        Self {
            entries: VecDeque::new(),
            horizon,
        }
    }

    pub fn horizon(&self) -> Seconds {
        self.horizon
    }

    /// Append a value and evict everything the new timestamp has outlived.
    ///
    /// Timestamps are expected to be non-decreasing; an out-of-order entry is
    /// still stored but eviction is always relative to the newest push.
    pub fn push(&mut self, timestamp: Seconds, value: T) {
        self.entries.push_back((timestamp, value));
        self.evict(timestamp);
    }

    /// Drop entries no longer retained at `now`
    pub fn evict(&mut self, now: Seconds) {
        let horizon = self.horizon;
        self.entries
            .retain(|(timestamp, _)| is_retained(now, *timestamp, horizon));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &(Seconds, T)> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn values(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter().map(|(_, value)| value)
    }

    pub fn latest(&self) -> Option<&(Seconds, T)> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl TemporalWindow<f64> {
    /// Mean of the retained values
    pub fn mean(&self) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        let sum: f64 = self.values().sum();
        Some(sum / self.entries.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_push_evicts_old_entries() {
        let mut window = TemporalWindow::new(10.0);
        window.push(0.0, 1.0);
        window.push(5.0, 2.0);
        window.push(10.0, 3.0);

        assert_eq!(window.len(), 2);
        assert_eq!(window.values().copied().collect::<Vec<_>>(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_explicit_evict() {
        let mut window = TemporalWindow::new(60.0);
        window.push(0.0, "a");
        window.push(30.0, "b");
        window.evict(75.0);

        assert_eq!(window.len(), 1);
        assert_eq!(window.latest(), Some(&(30.0, "b")));
    }

    #[test]
    fn test_mean() {
        let mut window = TemporalWindow::new(30.0);
        assert_eq!(window.mean(), None);
        window.push(1.0, 0.2);
        window.push(2.0, 0.4);
        assert!((window.mean().unwrap() - 0.3).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn test_never_retains_past_horizon(
            horizon in 1.0f64..60.0,
            steps in proptest::collection::vec(0.0f64..5.0, 1..200),
        ) {
            let mut window = TemporalWindow::new(horizon);
            let mut now = 0.0;
            for step in steps {
                now += step;
                window.push(now, ());
                for (timestamp, _) in window.iter() {
                    prop_assert!(now - timestamp < horizon);
                }
            }
        }
    }
}
