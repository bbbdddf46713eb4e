//! Subscription (filter) registry.
//!
//! Request handlers install filters on behalf of clients; the event lane
//! walks the registry and drains each contract-event filter's pending buffer.
//! The registry is shared between worker threads (which mutate it) and the
//! event lane (which reads and polls it), so every filter guards its own buffer
//! and the registry map sits behind a read-write lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::identity::ClientId;

/// Events buffered per filter before new ones are dropped.
pub const DEFAULT_FILTER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterKind {
    Block,
    Transaction,
    ContractEvent,
}

/// A log emitted by a contract, as pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub address: Vec<u8>,
    pub topics: Vec<Vec<u8>>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: Vec<u8>,
}

/// Which events a contract-event filter accepts. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMatch {
    pub addresses: Vec<Vec<u8>>,
    pub topics: Vec<Vec<u8>>,
}

impl EventMatch {
    pub fn matches(&self, event: &ContractEvent) -> bool {
        let address_ok = self.addresses.is_empty() || self.addresses.contains(&event.address);
        let topic_ok = self.topics.is_empty()
            || event
                .topics
                .iter()
                .any(|topic| self.topics.contains(topic));
        address_ok && topic_ok
    }
}

#[derive(Debug)]
pub struct Filter {
    id: u64,
    kind: FilterKind,
    criteria: EventMatch,
    capacity: usize,
    pending: Mutex<VecDeque<ContractEvent>>,
    dropped: AtomicU64,
}

impl Filter {
    pub fn new(id: u64, kind: FilterKind) -> Self {
        Self::with_criteria(id, kind, EventMatch::default())
    }

    pub fn with_criteria(id: u64, kind: FilterKind, criteria: EventMatch) -> Self {
        Self {
            id,
            kind,
            criteria,
            capacity: DEFAULT_FILTER_CAPACITY,
            pending: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Identifier of the connection this filter pushes to.
    pub fn client_id(&self) -> ClientId {
        ClientId::from_subscription_id(self.id)
    }

    pub fn matches(&self, event: &ContractEvent) -> bool {
        self.kind == FilterKind::ContractEvent && self.criteria.matches(event)
    }

    /// Buffers an event for the next poll. Returns `false` if the buffer is full
    /// and the event was dropped.
    pub fn push(&self, event: ContractEvent) -> bool {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        pending.push_back(event);
        true
    }

    /// Takes everything buffered so far, oldest first.
    pub fn poll(&self) -> Vec<ContractEvent> {
        self.pending.lock().drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Events dropped on a full buffer since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: RwLock<HashMap<u64, Arc<Filter>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a filter, returning the one it replaced.
    pub fn install(&self, filter: Filter) -> Option<Arc<Filter>> {
        self.filters.write().insert(filter.id(), Arc::new(filter))
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Filter>> {
        self.filters.write().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Filter>> {
        self.filters.read().get(&id).cloned()
    }

    /// Current filters. The lock is released before the caller polls them, so
    /// filters installed or removed meanwhile show up on the next snapshot.
    pub fn snapshot(&self) -> Vec<Arc<Filter>> {
        self.filters.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.read().is_empty()
    }

    /// Buffers `event` in every contract-event filter it matches. Returns how
    /// many filters accepted it.
    pub fn publish(&self, event: &ContractEvent) -> usize {
        self.snapshot()
            .iter()
            .filter(|filter| filter.matches(event))
            .filter(|filter| filter.push(event.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(address: u8, topic: u8) -> ContractEvent {
        ContractEvent {
            address: vec![address; 4],
            topics: vec![vec![topic; 4]],
            data: vec![address, topic],
            block_number: 7,
            tx_hash: vec![0xab; 32],
        }
    }

    #[test]
    fn poll_drains_buffer() {
        let filter = Filter::new(1, FilterKind::ContractEvent);
        for i in 0..3 {
            assert!(filter.push(event(i, i)));
        }

        let polled = filter.poll();
        assert_eq!(polled.len(), 3);
        assert_eq!(polled[0], event(0, 0));
        assert!(filter.poll().is_empty());
    }

    #[test]
    fn full_buffer_drops_new_events() {
        let filter = Filter::new(1, FilterKind::ContractEvent).capacity(2);
        assert!(filter.push(event(1, 1)));
        assert!(filter.push(event(2, 2)));
        assert!(!filter.push(event(3, 3)));
        assert_eq!(filter.take_dropped(), 1);
        assert_eq!(filter.take_dropped(), 0);
        assert_eq!(filter.pending_len(), 2);
    }

    #[test]
    fn publish_respects_kind_and_criteria() {
        let registry = FilterRegistry::new();
        registry.install(Filter::new(1, FilterKind::ContractEvent));
        registry.install(Filter::new(2, FilterKind::Block));
        registry.install(Filter::with_criteria(
            3,
            FilterKind::ContractEvent,
            EventMatch {
                addresses: vec![vec![9; 4]],
                topics: Vec::new(),
            },
        ));

        assert_eq!(registry.publish(&event(1, 1)), 1);
        assert_eq!(registry.publish(&event(9, 1)), 2);

        assert_eq!(registry.get(1).expect("filter 1").pending_len(), 2);
        assert_eq!(registry.get(2).expect("filter 2").pending_len(), 0);
        assert_eq!(registry.get(3).expect("filter 3").pending_len(), 1);
    }

    #[test]
    fn filter_addresses_owner() {
        let filter = Filter::new(0xAA, FilterKind::ContractEvent);
        assert_eq!(filter.client_id(), ClientId::new([0, 0, 0, 0, 0xAA]));
    }

    #[test]
    fn install_replaces_and_remove_forgets() {
        let registry = FilterRegistry::new();
        assert!(registry.install(Filter::new(5, FilterKind::Block)).is_none());
        assert!(
            registry
                .install(Filter::new(5, FilterKind::ContractEvent))
                .is_some()
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(5).is_some());
        assert!(registry.is_empty());
    }
}
