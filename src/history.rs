//! Bounded historization of variable writes.
//!
//! Each enabled node keeps a capacity-bounded log of its value changes,
//! newest first. Recording on a node that was never enabled is a silent
//! no-op, so callers can write values without caring whether anyone asked
//! for history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::model::{NodeId, Value};

/// Sample capacity used when history is enabled without an explicit one.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// One recorded value change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Per-node bounded sample logs.
#[derive(Debug, Default)]
pub struct HistoryStore {
    buffers: HashMap<NodeId, HistoryBuffer>,
}

#[derive(Debug)]
struct HistoryBuffer {
    /// Front is the newest sample.
    samples: VecDeque<HistorySample>,
    capacity: usize,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts historizing `node` with the given capacity. Idempotent: an
    /// already-enabled node keeps its samples; a smaller capacity drops the
    /// oldest samples beyond it.
    pub fn enable(&mut self, node: NodeId, capacity: usize) {
        let capacity = capacity.max(1);
        match self.buffers.get_mut(&node) {
            Some(buffer) => {
                buffer.capacity = capacity;
                buffer.samples.truncate(capacity);
            }
            None => {
                self.buffers.insert(
                    node,
                    HistoryBuffer { samples: VecDeque::with_capacity(capacity), capacity },
                );
            }
        }
    }

    pub fn is_enabled(&self, node: &NodeId) -> bool {
        self.buffers.contains_key(node)
    }

    pub fn capacity(&self, node: &NodeId) -> Option<usize> {
        self.buffers.get(node).map(|b| b.capacity)
    }

    /// Appends a sample, evicting the oldest one beyond capacity.
    /// Returns false (and records nothing) when the node is not enabled.
    pub fn record(&mut self, node: &NodeId, value: Value, timestamp: DateTime<Utc>) -> bool {
        let Some(buffer) = self.buffers.get_mut(node) else {
            return false;
        };
        buffer.samples.push_front(HistorySample { value, timestamp });
        buffer.samples.truncate(buffer.capacity);
        true
    }

    /// Snapshot of the retained samples, newest first. Later writes never
    /// alter an already-returned snapshot. A node that was never enabled
    /// reads as empty.
    pub fn read(&self, node: &NodeId) -> Vec<HistorySample> {
        self.buffers
            .get(node)
            .map(|b| b.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, node: &NodeId) -> usize {
        self.buffers.get(node).map(|b| b.samples.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node() -> NodeId {
        NodeId::numeric(2, 7)
    }

    fn record_ints(store: &mut HistoryStore, values: &[i64]) {
        for v in values {
            store.record(&node(), Value::Int(*v), Utc::now());
        }
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let mut store = HistoryStore::new();
        store.enable(node(), 3);
        record_ints(&mut store, &[10, 20, 30, 40]);

        let values: Vec<_> = store.read(&node()).into_iter().map(|s| s.value).collect();
        assert_eq!(values, vec![Value::Int(40), Value::Int(30), Value::Int(20)]);
    }

    #[test]
    fn test_record_without_enable_is_noop() {
        let mut store = HistoryStore::new();
        assert!(!store.record(&node(), Value::Int(1), Utc::now()));
        assert!(store.read(&node()).is_empty());
    }

    #[test]
    fn test_enable_is_idempotent() {
        let mut store = HistoryStore::new();
        store.enable(node(), 5);
        record_ints(&mut store, &[1, 2]);
        store.enable(node(), 5);
        assert_eq!(store.len(&node()), 2);
    }

    #[test]
    fn test_shrinking_capacity_drops_oldest() {
        let mut store = HistoryStore::new();
        store.enable(node(), 5);
        record_ints(&mut store, &[1, 2, 3, 4]);
        store.enable(node(), 2);

        let values: Vec<_> = store.read(&node()).into_iter().map(|s| s.value).collect();
        assert_eq!(values, vec![Value::Int(4), Value::Int(3)]);
        assert_eq!(store.capacity(&node()), Some(2));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let mut store = HistoryStore::new();
        store.enable(node(), 3);
        record_ints(&mut store, &[1, 2]);

        let snapshot = store.read(&node());
        record_ints(&mut store, &[3, 4]);

        let values: Vec<_> = snapshot.into_iter().map(|s| s.value).collect();
        assert_eq!(values, vec![Value::Int(2), Value::Int(1)]);
    }

    proptest! {
        #[test]
        fn prop_retention_bound(
            capacity in 1usize..16,
            values in proptest::collection::vec(any::<i64>(), 0..64),
        ) {
            let mut store = HistoryStore::new();
            store.enable(node(), capacity);
            record_ints(&mut store, &values);

            let read: Vec<_> = store.read(&node()).into_iter().map(|s| s.value).collect();
            let expected: Vec<_> = values
                .iter()
                .rev()
                .take(capacity)
                .map(|v| Value::Int(*v))
                .collect();
            prop_assert_eq!(read, expected);
        }
    }
}
