//! Trigger debouncing.
//!
//! Collapses bursts of triggers: a trigger is admitted only if at least
//! `min_interval` has passed since the last *admitted* trigger. Rejected
//! triggers do not move the window.

use std::time::{Duration, Instant};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Debouncer {
    min_interval: Duration,
    last_admitted: Option<Instant>,
}

impl Debouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_admitted: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Admit or reject a trigger that happened at `at`.
    ///
    /// A trigger stamped earlier than the last admission is rejected.
    pub fn admit(&mut self, at: Instant) -> bool {
        let admitted = match self.last_admitted {
            None => true,
            Some(last) => at
                .checked_duration_since(last)
                .is_some_and(|gap| gap >= self.min_interval),
        };
        if admitted {
            self.last_admitted = Some(at);
        }
        admitted
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn second_trigger_inside_window_is_dropped() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(ms(500));
        assert!(d.admit(t0));
        assert!(!d.admit(t0 + ms(200)));
    }

    #[test]
    fn burst_of_fifty_admits_one() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(ms(500));
        let admitted = (0..50).filter(|i| d.admit(t0 + ms(i * 2))).count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn window_is_measured_from_last_admitted_trigger() {
        // Raw gaps are all 300ms, but 600 - 0 >= 500 admits the third.
        let t0 = Instant::now();
        let mut d = Debouncer::new(ms(500));
        let results: Vec<bool> = [0, 300, 600, 900, 1200]
            .iter()
            .map(|&t| d.admit(t0 + ms(t)))
            .collect();
        assert_eq!(results, vec![true, false, true, false, true]);
    }

    #[test]
    fn exact_interval_is_admitted() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(ms(500));
        assert!(d.admit(t0));
        assert!(d.admit(t0 + ms(500)));
    }

    #[test]
    fn earlier_timestamp_is_rejected() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(ms(500));
        assert!(d.admit(t0 + ms(1000)));
        assert!(!d.admit(t0));
    }

    #[test]
    fn admitted_count_matches_reference_rule() {
        // Pseudo-random arrival gaps, checked against a straightforward replay.
        let t0 = Instant::now();
        let mut seed = 0x2545_f491_u64;
        let mut offsets = Vec::new();
        let mut t = 0u64;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            t += seed % 700;
            offsets.push(t);
        }

        let mut expected = 0;
        let mut last: Option<u64> = None;
        for &o in &offsets {
            if last.is_none_or(|l| o - l >= 500) {
                expected += 1;
                last = Some(o);
            }
        }

        let mut d = Debouncer::new(ms(500));
        let admitted = offsets.iter().filter(|&&o| d.admit(t0 + ms(o))).count();
        assert_eq!(admitted, expected);
    }
}
