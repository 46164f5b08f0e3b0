//! Process-wide, capacity-bounded store of rendered viewer frames.
//!
//! Entries are handed out as `Arc<FrameEntry>`: eviction drops the cache's
//! reference only, so a frame being read by presentation stays alive until the
//! reader lets go. Observers receive [`CacheEvent`]s through bounded channels;
//! delivery is advisory and never blocks a cache operation.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use frame_model::{FrameEntry, FrameKey, PixelRect};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    EntryAdded { key: FrameKey, byte_len: usize },
    EntryRemoved { key: FrameKey, byte_len: usize },
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheInsertError {
    #[error("frame of {byte_len} bytes exceeds cache capacity of {capacity_bytes} bytes")]
    ExceedsCapacity {
        byte_len: usize,
        capacity_bytes: usize,
    },
    #[error("frame of {byte_len} bytes does not match the {expected} bytes its key describes")]
    SizeMismatch { byte_len: usize, expected: usize },
    #[error("display cache is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<FrameKey, Arc<FrameEntry>>,
    total_bytes: usize,
    stats: CacheStats,
    shut_down: bool,
}

#[derive(Debug)]
pub struct DisplayCache {
    capacity_bytes: usize,
    state: Mutex<CacheState>,
    subscribers: Mutex<Vec<Sender<CacheEvent>>>,
}

impl DisplayCache {
    pub fn new(capacity_bytes: usize) -> Self {
        assert!(
            capacity_bytes > 0,
            "display cache capacity must be greater than zero"
        );
        Self {
            capacity_bytes,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                stats: CacheStats::default(),
                shut_down: false,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    pub fn contains(&self, key: &FrameKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Registers an observer for added/removed/cleared notifications.
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        let (sender, receiver) = bounded(EVENT_QUEUE_CAPACITY);
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Returns the entry for `key` and marks it most recently used.
    pub fn lookup(&self, key: &FrameKey) -> Option<Arc<FrameEntry>> {
        let mut state = self.state.lock();
        if state.shut_down {
            return None;
        }
        let found = state.entries.get(key).cloned();
        if found.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        trace!(%key, hit = found.is_some(), "[display_cache] lookup");
        found
    }

    /// Allocates a new entry for `key`, copies `pixels` into it and evicts
    /// least recently used entries until the cache fits its capacity again.
    /// An existing entry under the same key is replaced.
    pub fn insert(
        &self,
        key: FrameKey,
        data_window: PixelRect,
        display_window: PixelRect,
        pixels: &[u8],
    ) -> Result<Arc<FrameEntry>, CacheInsertError> {
        let byte_len = pixels.len();
        if byte_len != key.expected_byte_len() {
            return Err(CacheInsertError::SizeMismatch {
                byte_len,
                expected: key.expected_byte_len(),
            });
        }
        if byte_len > self.capacity_bytes {
            return Err(CacheInsertError::ExceedsCapacity {
                byte_len,
                capacity_bytes: self.capacity_bytes,
            });
        }

        let entry = Arc::new(FrameEntry::new(
            key,
            data_window,
            display_window,
            pixels.to_vec().into_boxed_slice(),
        ));

        let mut events = Vec::new();
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(CacheInsertError::ShutDown);
        }
        if let Some(replaced) = state.entries.put(key, entry.clone()) {
            state.total_bytes -= replaced.byte_len();
            events.push(CacheEvent::EntryRemoved {
                key,
                byte_len: replaced.byte_len(),
            });
        }
        state.total_bytes += byte_len;
        state.stats.insertions += 1;
        events.push(CacheEvent::EntryAdded { key, byte_len });

        while state.total_bytes > self.capacity_bytes {
            let Some((evicted_key, evicted)) = state.entries.pop_lru() else {
                panic!("display cache byte count exceeds capacity with no entries left");
            };
            state.total_bytes -= evicted.byte_len();
            state.stats.evictions += 1;
            events.push(CacheEvent::EntryRemoved {
                key: evicted_key,
                byte_len: evicted.byte_len(),
            });
        }
        debug!(
            %key,
            byte_len,
            total_bytes = state.total_bytes,
            entries = state.entries.len(),
            "[display_cache] inserted frame"
        );
        // Published under the state lock so observers see mutations in order.
        self.publish(&events);
        Ok(entry)
    }

    /// Drops every cached entry. Outstanding `Arc<FrameEntry>` handles stay valid.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_bytes = 0;
        self.publish(&[CacheEvent::Cleared]);
    }

    /// Clears the cache, refuses further inserts and disconnects observers.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_bytes = 0;
        state.shut_down = true;
        self.publish(&[CacheEvent::Cleared]);
        self.subscribers.lock().clear();
        drop(state);
        debug!("[display_cache] shut down");
    }

    /// Callers hold the state lock. `try_send` never blocks, so a slow
    /// observer only loses events.
    fn publish(&self, events: &[CacheEvent]) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            for event in events {
                match subscriber.try_send(*event) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
            true
        });
    }
}
