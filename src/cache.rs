//! Parameterized query cache.
//!
//! One entry per query key. Every fetch start bumps the entry's generation
//! and the fetch task carries the generation it was started with; a
//! completion whose generation is no longer current is dropped, so a late
//! response can never overwrite a newer one. Nothing is cancelled on the
//! wire. A refresh keeps the previous result visible while loading.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::logging::{log, obj, v_str, Domain, Level};

#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static;
    type Data: Send + Sync + 'static;

    async fn fetch(&self, key: &Self::Key) -> Result<Self::Data, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Idle,
    Loading,
    Ready,
    Failed,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Idle => "idle",
            CacheStatus::Loading => "loading",
            CacheStatus::Ready => "ready",
            CacheStatus::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub struct QueryResult<K, T> {
    pub key: K,
    pub data: Arc<T>,
    pub fetched_at: DateTime<Utc>,
    received: Instant,
}

impl<K: Clone, T> Clone for QueryResult<K, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            data: Arc::clone(&self.data),
            fetched_at: self.fetched_at,
            received: self.received,
        }
    }
}

impl<K, T> QueryResult<K, T> {
    pub fn age(&self) -> Duration {
        self.received.elapsed()
    }
}

/// Snapshot of one key's cache entry.
#[derive(Debug)]
pub struct CacheEntry<K, T> {
    pub key: K,
    pub status: CacheStatus,
    pub result: Option<QueryResult<K, T>>,
    pub error: Option<TransportError>,
    pub generation: u64,
}

impl<K: Clone, T> Clone for CacheEntry<K, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            generation: self.generation,
        }
    }
}

impl<K, T> CacheEntry<K, T> {
    fn idle(key: K) -> Self {
        Self {
            key,
            status: CacheStatus::Idle,
            result: None,
            error: None,
            generation: 0,
        }
    }

    pub fn data(&self) -> Option<&T> {
        self.result.as_ref().map(|r| r.data.as_ref())
    }

    fn begin_fetch(&mut self) -> u64 {
        self.generation += 1;
        self.status = CacheStatus::Loading;
        self.error = None;
        self.generation
    }
}

struct CacheState<K, T> {
    entries: HashMap<K, CacheEntry<K, T>>,
    active: Option<K>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

struct CacheCore<F: Fetcher> {
    fetcher: F,
    max_age: Option<Duration>,
    state: Mutex<CacheState<F::Key, F::Data>>,
    changes: watch::Sender<u64>,
}

impl<F: Fetcher> CacheCore<F> {
    fn lock(&self) -> MutexGuard<'_, CacheState<F::Key, F::Data>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v += 1);
    }

    fn complete(&self, key: F::Key, generation: u64, outcome: Result<F::Data, TransportError>) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let Some(entry) = state.entries.get_mut(&key) else {
                return;
            };
            if entry.generation != generation {
                log(
                    Level::Debug,
                    Domain::Cache,
                    "cache.stale_dropped",
                    obj(&[
                        ("key", v_str(&key.to_string())),
                        ("generation", json!(generation)),
                        ("current_generation", json!(entry.generation)),
                    ]),
                );
                return;
            }
            match outcome {
                Ok(data) => {
                    entry.status = CacheStatus::Ready;
                    entry.error = None;
                    entry.result = Some(QueryResult {
                        key: key.clone(),
                        data: Arc::new(data),
                        fetched_at: Utc::now(),
                        received: Instant::now(),
                    });
                }
                Err(err) => {
                    entry.status = CacheStatus::Failed;
                    entry.error = Some(err);
                }
            }
            log(
                Level::Info,
                Domain::Cache,
                "cache.settled",
                obj(&[
                    ("key", v_str(&key.to_string())),
                    ("status", v_str(entry.status.as_str())),
                    ("generation", json!(generation)),
                ]),
            );
        }
        self.notify();
    }
}

pub struct QueryCache<F: Fetcher> {
    core: Arc<CacheCore<F>>,
}

impl<F: Fetcher> QueryCache<F> {
    pub fn new(fetcher: F) -> Self {
        Self::with_max_age(fetcher, None)
    }

    /// Ready entries older than `max_age` are refetched on the next `select`.
    pub fn with_max_age(fetcher: F, max_age: Option<Duration>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            core: Arc::new(CacheCore {
                fetcher,
                max_age,
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    active: None,
                    tasks: Vec::new(),
                    closed: false,
                }),
                changes,
            }),
        }
    }

    /// Make `key` the active selection and return its entry.
    ///
    /// Fetches only when the key has never been loaded (or its result has
    /// expired). A key that is already loading or ready is returned as is,
    /// and a failed key stays failed until `refresh`.
    pub fn select(&self, key: F::Key) -> CacheEntry<F::Key, F::Data> {
        let (snapshot, changed) = {
            let mut state = self.core.lock();
            let switched = state.active.as_ref() != Some(&key);
            state.active = Some(key.clone());
            let max_age = self.core.max_age;
            let closed = state.closed;
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::idle(key.clone()));
            let expired = match (&entry.result, max_age) {
                (Some(result), Some(max_age)) => result.age() >= max_age,
                _ => false,
            };
            let needs_fetch = match entry.status {
                CacheStatus::Idle => true,
                CacheStatus::Ready => expired,
                CacheStatus::Loading | CacheStatus::Failed => false,
            };
            if needs_fetch && !closed {
                let generation = entry.begin_fetch();
                let snapshot = entry.clone();
                self.spawn_fetch(&mut state, key, generation);
                (snapshot, true)
            } else {
                (entry.clone(), switched)
            }
        };
        if changed {
            self.core.notify();
        }
        snapshot
    }

    /// Force a new fetch for `key` whatever its status.
    pub fn refresh(&self, key: F::Key) -> CacheEntry<F::Key, F::Data> {
        let snapshot = {
            let mut state = self.core.lock();
            let closed = state.closed;
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::idle(key.clone()));
            if closed {
                return entry.clone();
            }
            let generation = entry.begin_fetch();
            let snapshot = entry.clone();
            self.spawn_fetch(&mut state, key, generation);
            snapshot
        };
        self.core.notify();
        snapshot
    }

    fn spawn_fetch(&self, state: &mut CacheState<F::Key, F::Data>, key: F::Key, generation: u64) {
        log(
            Level::Info,
            Domain::Cache,
            "cache.fetch",
            obj(&[("key", v_str(&key.to_string())), ("generation", json!(generation))]),
        );
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            let outcome = core.fetcher.fetch(&key).await;
            core.complete(key, generation, outcome);
        });
        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(handle);
    }

    pub fn get(&self, key: &F::Key) -> Option<CacheEntry<F::Key, F::Data>> {
        self.core.lock().entries.get(key).cloned()
    }

    pub fn active_key(&self) -> Option<F::Key> {
        self.core.lock().active.clone()
    }

    /// Entry for the active selection only; what the view renders.
    pub fn active(&self) -> Option<CacheEntry<F::Key, F::Data>> {
        let state = self.core.lock();
        let key = state.active.as_ref()?;
        state.entries.get(key).cloned()
    }

    /// Ticks whenever an entry or the active key changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.core.changes.subscribe()
    }

    /// Abort in-flight fetches and stop accepting new ones.
    pub fn shutdown(&self) {
        let tasks = {
            let mut state = self.core.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.tasks)
        };
        for task in &tasks {
            task.abort();
        }
        log(
            Level::Info,
            Domain::System,
            "cache.shutdown",
            obj(&[("aborted", json!(tasks.len()))]),
        );
    }
}

impl<F: Fetcher> Drop for QueryCache<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
