use crate::{
    config::DEFAULT_GROWTH_WINDOW,
    types::{PriceSample, Symbol},
};
use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};
use tracing::debug;

/// Rolling per-symbol price windows producing a growth percentage.
///
/// Each window is kept sorted by timestamp and covers at most `window`
/// measured back from its newest sample.
#[derive(Debug, Clone)]
pub struct GrowthCalculator {
    window_ms: i64,
    windows: HashMap<Symbol, VecDeque<PriceSample>>,
}

impl Default for GrowthCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_GROWTH_WINDOW)
    }
}

impl GrowthCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            windows: HashMap::new(),
        }
    }

    /// Record a price observation, `timestamp` in epoch milliseconds.
    ///
    /// Late samples are inserted in order; a sample already older than the
    /// window cutoff is discarded.
    pub fn add_sample(&mut self, symbol: &Symbol, price: f64, timestamp: i64) {
        if !price.is_finite() {
            debug!(%symbol, price, "ignoring non-finite price sample");
            return;
        }

        let window = self.windows.entry(symbol.clone()).or_default();
        let sample = PriceSample::new(price, timestamp);

        match window.back() {
            Some(back) if back.timestamp > timestamp => {
                let index = window.partition_point(|s| s.timestamp <= timestamp);
                window.insert(index, sample);
            }
            _ => window.push_back(sample),
        }

        let Some(newest) = window.back().map(|s| s.timestamp) else {
            return;
        };
        let cutoff = newest.saturating_sub(self.window_ms);
        while let Some(front) = window.front() {
            if front.timestamp < cutoff {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Percentage change from the oldest to the newest sample in the window.
    ///
    /// Returns 0 with fewer than two samples or a non-positive oldest price.
    pub fn growth(&self, symbol: &Symbol) -> f64 {
        let Some(window) = self.windows.get(symbol) else {
            return 0.0;
        };

        match (window.front(), window.back()) {
            (Some(oldest), Some(latest)) if window.len() >= 2 && oldest.price > 0.0 => {
                (latest.price - oldest.price) / oldest.price * 100.0
            }
            _ => 0.0,
        }
    }

    pub fn growth_all(&self) -> HashMap<Symbol, f64> {
        self.windows
            .keys()
            .map(|symbol| (symbol.clone(), self.growth(symbol)))
            .collect()
    }

    pub fn sample_count(&self, symbol: &Symbol) -> usize {
        self.windows.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.window_ms).unwrap_or(0))
    }

    pub fn clear_symbol(&mut self, symbol: &Symbol) {
        self.windows.remove(symbol);
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: i64 = 60 * 1000;

    fn btc() -> Symbol {
        Symbol::parse("BTCUSDT").unwrap()
    }

    #[test]
    fn test_growth_over_full_window() {
        let mut calc = GrowthCalculator::default();
        let t0 = 1_700_000_000_000;

        calc.add_sample(&btc(), 100.0, t0);
        calc.add_sample(&btc(), 110.0, t0 + 5 * MINUTE_MS);

        assert!((calc.growth(&btc()) - 10.0).abs() < 0.0001);
        assert_eq!(calc.sample_count(&btc()), 2);
    }

    #[test]
    fn test_growth_degenerate_windows() {
        struct TestCase {
            samples: Vec<(f64, i64)>,
            expected: f64,
        }

        let tests = vec![
            TestCase {
                // TC0: no samples
                samples: vec![],
                expected: 0.0,
            },
            TestCase {
                // TC1: single sample
                samples: vec![(100.0, 0)],
                expected: 0.0,
            },
            TestCase {
                // TC2: zero oldest price
                samples: vec![(0.0, 0), (10.0, MINUTE_MS)],
                expected: 0.0,
            },
            TestCase {
                // TC3: negative move
                samples: vec![(200.0, 0), (150.0, MINUTE_MS)],
                expected: -25.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut calc = GrowthCalculator::default();
            for (price, timestamp) in test.samples {
                calc.add_sample(&btc(), price, timestamp);
            }
            let actual = calc.growth(&btc());
            assert!((actual - test.expected).abs() < 0.0001, "TC{} failed", index);
        }
    }

    #[test]
    fn test_samples_outside_window_are_evicted() {
        let mut calc = GrowthCalculator::default();

        calc.add_sample(&btc(), 50.0, 0);
        calc.add_sample(&btc(), 100.0, MINUTE_MS);
        calc.add_sample(&btc(), 120.0, 6 * MINUTE_MS + 1);

        // 0 is outside the window, MINUTE_MS is 1ms too old as well
        assert_eq!(calc.sample_count(&btc()), 1);
        assert_eq!(calc.growth(&btc()), 0.0);

        calc.add_sample(&btc(), 132.0, 7 * MINUTE_MS);
        assert!((calc.growth(&btc()) - 10.0).abs() < 0.0001);
    }

    #[test]
    fn test_late_samples_keep_window_sorted() {
        let mut calc = GrowthCalculator::default();

        calc.add_sample(&btc(), 110.0, 4 * MINUTE_MS);
        calc.add_sample(&btc(), 100.0, MINUTE_MS);
        calc.add_sample(&btc(), 105.0, 2 * MINUTE_MS);

        // Oldest is the late 100.0, newest stays 110.0
        assert!((calc.growth(&btc()) - 10.0).abs() < 0.0001);

        // Older than newest - window, dropped on arrival
        calc.add_sample(&btc(), 1.0, -2 * MINUTE_MS);
        assert_eq!(calc.sample_count(&btc()), 3);
        assert!((calc.growth(&btc()) - 10.0).abs() < 0.0001);
    }

    #[test]
    fn test_clear_symbol_is_independent() {
        let eth = Symbol::parse("ETHUSDT").unwrap();
        let mut calc = GrowthCalculator::default();

        calc.add_sample(&btc(), 100.0, 0);
        calc.add_sample(&btc(), 101.0, MINUTE_MS);
        calc.add_sample(&eth, 10.0, 0);
        calc.add_sample(&eth, 12.0, MINUTE_MS);

        calc.clear_symbol(&btc());

        let all = calc.growth_all();
        assert_eq!(all.len(), 1);
        assert!((all[&eth] - 20.0).abs() < 0.0001);
        assert_eq!(calc.growth(&btc()), 0.0);
    }
}
