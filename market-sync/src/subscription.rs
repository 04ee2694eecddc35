use crate::{config::DEFAULT_SUBSCRIPTION_CAPACITY, types::Symbol};
use std::collections::HashSet;
use tracing::{debug, info};

/// Symbols entering and leaving the streamed set after a watch-list change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub subscribe: Vec<Symbol>,
    pub unsubscribe: Vec<Symbol>,
}

impl SubscriptionDiff {
    /// Nothing changed, no reconnection is needed.
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

/// Maintains the bounded, prioritised set of streamed ticker symbols.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    capacity: usize,
    active: Vec<Symbol>,
    priority: Option<Symbol>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_CAPACITY)
    }
}

impl SubscriptionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            active: Vec::with_capacity(capacity),
            priority: None,
        }
    }

    /// Replace the watch list and report the change against the previous set.
    ///
    /// The priority symbol takes slot 0 when it appears in `requested`;
    /// symbols past capacity are dropped.
    pub fn set_watch_list(
        &mut self,
        requested: &[Symbol],
        priority: Option<&Symbol>,
    ) -> SubscriptionDiff {
        let next = prioritise(requested, priority, self.capacity);
        let diff = diff(&self.active, &next);

        self.priority = priority
            .filter(|symbol| requested.contains(symbol))
            .cloned();
        self.active = next;

        if !diff.is_empty() {
            info!(
                subscribe = ?diff.subscribe,
                unsubscribe = ?diff.unsubscribe,
                active = self.active.len(),
                "watch list changed"
            );
        }

        diff
    }

    pub fn active(&self) -> &[Symbol] {
        &self.active
    }

    pub fn priority(&self) -> Option<&Symbol> {
        self.priority.as_ref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.active.contains(symbol)
    }

    /// Drop every subscription, returning what was removed.
    pub fn clear(&mut self) -> SubscriptionDiff {
        self.priority = None;
        SubscriptionDiff {
            subscribe: Vec::new(),
            unsubscribe: std::mem::take(&mut self.active),
        }
    }
}

/// Deduplicate, move the priority symbol to the front and cap at `capacity`.
pub fn prioritise(requested: &[Symbol], priority: Option<&Symbol>, capacity: usize) -> Vec<Symbol> {
    let mut seen = HashSet::with_capacity(requested.len());
    let mut set = Vec::with_capacity(capacity.min(requested.len()));

    if let Some(priority) = priority.filter(|p| requested.contains(p)) {
        if capacity > 0 {
            seen.insert(priority.clone());
            set.push(priority.clone());
        }
    }

    for symbol in requested {
        if set.len() >= capacity {
            break;
        }
        if seen.insert(symbol.clone()) {
            set.push(symbol.clone());
        }
    }

    let dropped = requested
        .iter()
        .filter(|symbol| !set.contains(symbol))
        .collect::<HashSet<_>>()
        .len();
    if dropped > 0 {
        debug!(dropped, capacity, "watch list truncated to capacity");
    }

    set
}

fn diff(previous: &[Symbol], next: &[Symbol]) -> SubscriptionDiff {
    SubscriptionDiff {
        subscribe: next
            .iter()
            .filter(|symbol| !previous.contains(symbol))
            .cloned()
            .collect(),
        unsubscribe: previous
            .iter()
            .filter(|symbol| !next.contains(symbol))
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(|name| Symbol::parse(name).unwrap()).collect()
    }

    fn generated(count: usize) -> Vec<Symbol> {
        (0..count)
            .map(|i| Symbol::parse(&format!("COIN{i}USDT")).unwrap())
            .collect()
    }

    #[test]
    fn test_prioritise() {
        struct TestCase {
            requested: Vec<Symbol>,
            priority: Option<Symbol>,
            capacity: usize,
            expected: Vec<Symbol>,
        }

        let tests = vec![
            TestCase {
                // TC0: priority moves to slot 0
                requested: symbols(&["ETHUSDT", "SOLUSDT", "BTCUSDT"]),
                priority: Some(Symbol::parse("BTCUSDT").unwrap()),
                capacity: 12,
                expected: symbols(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]),
            },
            TestCase {
                // TC1: priority absent from the request is ignored
                requested: symbols(&["ETHUSDT", "SOLUSDT"]),
                priority: Some(Symbol::parse("BTCUSDT").unwrap()),
                capacity: 12,
                expected: symbols(&["ETHUSDT", "SOLUSDT"]),
            },
            TestCase {
                // TC2: duplicates keep first occurrence
                requested: symbols(&["ETHUSDT", "SOLUSDT", "ETHUSDT"]),
                priority: None,
                capacity: 12,
                expected: symbols(&["ETHUSDT", "SOLUSDT"]),
            },
            TestCase {
                // TC3: truncation keeps the priority
                requested: symbols(&["ETHUSDT", "SOLUSDT", "XRPUSDT", "BTCUSDT"]),
                priority: Some(Symbol::parse("BTCUSDT").unwrap()),
                capacity: 2,
                expected: symbols(&["BTCUSDT", "ETHUSDT"]),
            },
            TestCase {
                // TC4: zero capacity streams nothing
                requested: symbols(&["ETHUSDT"]),
                priority: Some(Symbol::parse("ETHUSDT").unwrap()),
                capacity: 0,
                expected: vec![],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = prioritise(&test.requested, test.priority.as_ref(), test.capacity);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_twenty_requested_symbols_capped_at_twelve() {
        let requested = generated(20);
        let priority = requested[15].clone();
        let mut manager = SubscriptionManager::default();

        let diff = manager.set_watch_list(&requested, Some(&priority));

        assert_eq!(manager.active().len(), 12);
        assert_eq!(manager.active()[0], priority);
        assert_eq!(&manager.active()[1..], &requested[..11]);
        assert_eq!(diff.subscribe.len(), 12);
        assert!(diff.unsubscribe.is_empty());
        assert_eq!(manager.priority(), Some(&priority));
    }

    #[test]
    fn test_reordered_watch_list_produces_empty_diff() {
        let mut manager = SubscriptionManager::default();
        manager.set_watch_list(&symbols(&["BTCUSDT", "ETHUSDT"]), None);

        let diff = manager.set_watch_list(
            &symbols(&["ETHUSDT", "BTCUSDT"]),
            Some(&Symbol::parse("ETHUSDT").unwrap()),
        );

        assert!(diff.is_empty());
        assert_eq!(manager.active(), symbols(&["ETHUSDT", "BTCUSDT"]).as_slice());
    }

    #[test]
    fn test_diff_reports_both_directions() {
        let mut manager = SubscriptionManager::default();
        manager.set_watch_list(&symbols(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]), None);

        let diff = manager.set_watch_list(&symbols(&["ETHUSDT", "XRPUSDT"]), None);

        assert_eq!(diff.subscribe, symbols(&["XRPUSDT"]));
        assert_eq!(diff.unsubscribe, symbols(&["BTCUSDT", "SOLUSDT"]));
        assert!(manager.contains(&Symbol::parse("XRPUSDT").unwrap()));
        assert!(!manager.contains(&Symbol::parse("BTCUSDT").unwrap()));

        let cleared = manager.clear();
        assert_eq!(cleared.unsubscribe, symbols(&["ETHUSDT", "XRPUSDT"]));
        assert!(manager.active().is_empty());
    }
}
