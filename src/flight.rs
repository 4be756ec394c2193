//! Single-flight map: one execution per key, shared by every concurrent caller
//!
//! ```text
//! resolve A ─┐
//!            │
//! resolve B ─┼──► SingleFlight ──► leader runs the work once
//!            │         │                     │
//! resolve C ─┘         ▼                     ▼
//!               followers wait on    watch channel carries
//!               the same channel     the shared result
//! ```
//!
//! Completed results may stay in the map so later callers skip the work
//! entirely; entries completed without retention are removed so the next
//! caller runs the work again.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::watch;
use tracing::debug;

/// Outcome of registering interest in a key
pub enum Registration<K, V> {
    /// Caller must run the work and hand the result to [`SingleFlight::complete`]
    Leader(FlightLeader<K, V>),
    /// Work is already running; wait on the receiver
    Follower(watch::Receiver<Option<V>>),
    /// A retained result is available
    Ready(V),
}

/// Proof of leadership for one key
pub struct FlightLeader<K, V> {
    key: K,
    sender: watch::Sender<Option<V>>,
}

impl<K, V> FlightLeader<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Receiver the leader itself can wait on
    pub fn subscribe(&self) -> watch::Receiver<Option<V>> {
        self.sender.subscribe()
    }
}

/// Snapshot of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightState<V> {
    InFlight,
    Done(V),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct FlightStats {
    /// Total registrations
    pub requests: u64,
    /// Registrations that started new work
    pub leaders: u64,
    /// Registrations that joined running work
    pub coalesced: u64,
    /// Registrations answered from a retained result
    pub retained_hits: u64,
}

pub struct SingleFlight<K, V> {
    entries: Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
    stats: Mutex<FlightStats>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(FlightStats::default()),
        }
    }

    pub fn register(&self, key: K) -> Registration<K, V> {
        let mut entries = self.entries.lock();
        let mut stats = self.stats.lock();
        stats.requests += 1;

        if let Some(rx) = entries.get(&key) {
            if let Some(value) = rx.borrow().clone() {
                stats.retained_hits += 1;
                return Registration::Ready(value);
            }
            // A leader that vanished without completing leaves a closed channel
            if rx.has_changed().is_ok() {
                stats.coalesced += 1;
                return Registration::Follower(rx.clone());
            }
            debug!("Replacing abandoned in-flight entry");
        }

        let (sender, receiver) = watch::channel(None);
        entries.insert(key.clone(), receiver);
        stats.leaders += 1;
        Registration::Leader(FlightLeader { key, sender })
    }

    /// Publish the leader's result to every waiter.
    ///
    /// With `retain` the result answers later registrations; otherwise the
    /// entry is removed and the next registration becomes a new leader.
    pub fn complete(&self, leader: FlightLeader<K, V>, value: V, retain: bool) {
        let mut entries = self.entries.lock();
        let owned = entries
            .get(&leader.key)
            .map(|rx| rx.same_channel(&leader.sender.subscribe()))
            .unwrap_or(false);

        leader.sender.send_replace(Some(value));

        if owned && !retain {
            entries.remove(&leader.key);
        }
    }

    /// Drop a completed entry. In-flight entries are left alone.
    pub fn forget(&self, key: &K) -> bool {
        let mut entries = self.entries.lock();
        let done = entries
            .get(key)
            .map(|rx| rx.borrow().is_some())
            .unwrap_or(false);
        if done {
            entries.remove(key);
        }
        done
    }

    pub fn entries(&self) -> Vec<(K, FlightState<V>)> {
        self.entries
            .lock()
            .iter()
            .map(|(key, rx)| {
                let state = match rx.borrow().clone() {
                    Some(value) => FlightState::Done(value),
                    None => FlightState::InFlight,
                };
                (key.clone(), state)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FlightStats {
        self.stats.lock().clone()
    }
}

/// Wait until the channel carries a value.
///
/// Returns `None` if the leader went away without publishing one.
pub async fn wait<V: Clone>(mut rx: watch::Receiver<Option<V>>) -> Option<V> {
    loop {
        if let Some(value) = rx.borrow_and_update().clone() {
            return Some(value);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
