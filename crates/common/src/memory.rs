//! In-process [`Store`] and [`Queue`] implementations.
//!
//! Used by tests across the workspace and for running the service without
//! Redis. `MemoryStore` also counts writes per operation so tests can assert
//! exactly how many records a code path produced.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::queue::Queue;
use crate::store::Store;

/// Write counters observed by a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub adds: u64,
    pub removes: u64,
    pub sorted_set_adds: u64,
    pub sorted_set_removes: u64,
}

#[derive(Default)]
struct Counters {
    adds: AtomicU64,
    removes: AtomicU64,
    sorted_set_adds: AtomicU64,
    sorted_set_removes: AtomicU64,
}

#[derive(Default)]
struct State {
    values: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashMap<String, f64>>,
}

/// Thread-safe in-memory store with TTL support.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    counters: Counters,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            adds: self.counters.adds.load(Ordering::SeqCst),
            removes: self.counters.removes.load(Ordering::SeqCst),
            sorted_set_adds: self.counters.sorted_set_adds.load(Ordering::SeqCst),
            sorted_set_removes: self.counters.sorted_set_removes.load(Ordering::SeqCst),
        }
    }

    /// Score of `member` in `set`, if present.
    pub fn score(&self, set: &str, member: &str) -> Option<f64> {
        self.lock()
            .sets
            .get(set)
            .and_then(|members| members.get(member).copied())
    }

    /// Number of members in `set`.
    pub fn set_len(&self, set: &str) -> usize {
        self.lock().sets.get(set).map_or(0, |members| members.len())
    }

    /// Whether `key` holds an unexpired value.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .values
            .get(key)
            .is_some_and(|(_, expires)| expires.is_none_or(|at| at > now))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.lock()
            .values
            .insert(key.to_string(), (value.to_string(), expires));
        self.counters.adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, AppError> {
        let mut state = self.lock();
        match state.values.get(key) {
            Some((_, Some(expires))) if *expires <= Instant::now() => {
                state.values.remove(key);
                Err(AppError::NotFound(format!("key {} not found", key)))
            }
            Some((value, _)) => Ok(value.clone()),
            None => Err(AppError::NotFound(format!("key {} not found", key))),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        self.lock().values.remove(key);
        self.counters.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sorted_set_add(&self, set: &str, member: &str, score: f64) -> Result<(), AppError> {
        self.lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        self.counters.sorted_set_adds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<String>, AppError> {
        let state = self.lock();
        let Some(members) = state.sets.get(set) else {
            return Ok(Vec::new());
        };

        let mut in_range: Vec<(&String, f64)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        // Redis orders equal scores lexicographically.
        in_range.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        Ok(in_range
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn sorted_set_remove(&self, set: &str, member: &str) -> Result<(), AppError> {
        if let Some(members) = self.lock().sets.get_mut(set) {
            members.remove(member);
        }
        self.counters.sorted_set_removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-process FIFO queue.
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<Vec<u8>>>,
    available: Notify,
    connected: AtomicBool,
    closed: CancellationToken,
    published: AtomicU64,
}

impl MemoryQueue {
    /// A queue that is already connected.
    pub fn connected() -> Self {
        let queue = Self::default();
        queue.connected.store(true, Ordering::SeqCst);
        queue
    }

    /// Messages waiting to be consumed.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total successful publishes.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Remove and return the oldest pending message.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn connect_with_retry(&self, _max_attempts: u32, _pause: Duration) -> Result<(), AppError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, payload: &str) -> Result<(), AppError> {
        if !self.connected.load(Ordering::SeqCst) || self.closed.is_cancelled() {
            return Err(AppError::Io("memory queue is not connected".to_string()));
        }
        self.lock().push_back(payload.as_bytes().to_vec());
        self.published.fetch_add(1, Ordering::SeqCst);
        self.available.notify_one();
        Ok(())
    }

    async fn consume(
        &self,
        out: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AppError::Io("memory queue is not connected".to_string()));
        }

        loop {
            let payload = match self.pop() {
                Some(payload) => payload,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.closed.cancelled() => break,
                        _ = self.available.notified() => {}
                    }
                    continue;
                }
            };

            let permit = tokio::select! {
                permit = out.reserve() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            match permit {
                Some(permit) => permit.send(payload),
                None => {
                    self.lock().push_front(payload);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AppError> {
        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
