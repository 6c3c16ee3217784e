use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::ByteView;

/// Node-local value store consulted before any coordination happens.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<ByteView>;
    fn put(&self, key: &str, value: ByteView);
}

/// Byte-bounded least-recently-used store. An entry costs its key length plus
/// its value length; `max_bytes == 0` disables eviction.
pub struct LruStore {
    max_bytes: usize,
    inner: Mutex<LruInner>,
}

#[derive(Default)]
struct LruInner {
    entries: HashMap<String, LruEntry>,
    /// Access tick -> key, oldest first.
    recency: BTreeMap<u64, String>,
    tick: u64,
    used_bytes: usize,
}

struct LruEntry {
    value: ByteView,
    tick: u64,
}

impl LruStore {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(LruInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }
}

impl LruInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) -> Option<ByteView> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.to_string());
        Some(entry.value.clone())
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.used_bytes -= key.len() + entry.value.len();
        }
        true
    }
}

impl LocalStore for LruStore {
    fn get(&self, key: &str) -> Option<ByteView> {
        self.inner.lock().touch(key)
    }

    fn put(&self, key: &str, value: ByteView) {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let size = key.len() + value.len();
        if let Some(previous) = inner.entries.insert(key.to_string(), LruEntry { value, tick }) {
            inner.recency.remove(&previous.tick);
            inner.used_bytes -= key.len() + previous.value.len();
        }
        inner.recency.insert(tick, key.to_string());
        inner.used_bytes += size;

        if self.max_bytes == 0 {
            return;
        }
        while inner.used_bytes > self.max_bytes && inner.evict_oldest() {}
    }
}
