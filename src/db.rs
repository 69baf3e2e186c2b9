//! The keyspace: an arena of entries, a hash index from key to arena
//! id, and a min-heap of expiration deadlines.
//!
//! Entries carry their heap position so a TTL update or entry removal
//! can touch the heap in O(log n). All time-dependent methods take an
//! explicit `now` so tests control the clock.

use std::collections::VecDeque;

use slotmap::{SlotMap, new_key_type};

use crate::heap::{self, TtlItem};
use crate::hll::Hll;
use crate::hmap::HMap;
use crate::zset::ZSet;

/// At most this many expired keys are reaped per call; the rest wait
/// for the next tick so one mass expiry cannot stall the loop.
const EXPIRE_QUOTA: usize = 2000;

/// Containers at or above this many elements are freed off-thread.
pub const LARGE_CONTAINER_SIZE: usize = 1000;

new_key_type! {
    pub struct EntryId;
}

pub enum Value {
    Str(Vec<u8>),
    ZSet(ZSet),
    Hash(HMap<Vec<u8>, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Set(HMap<Vec<u8>, ()>),
    Bitmap(Vec<u8>),
    Hll(Hll),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::ZSet(_) => "zset",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Bitmap(_) => "bitmap",
            Value::Hll(_) => "hyperloglog",
        }
    }

    /// Rough cost of dropping this value, in elements. Flat byte blobs
    /// free in one call regardless of size.
    pub fn teardown_weight(&self) -> usize {
        match self {
            Value::Str(_) | Value::Bitmap(_) | Value::Hll(_) => 1,
            Value::ZSet(z) => z.len(),
            Value::Hash(h) => h.len(),
            Value::List(l) => l.len(),
            Value::Set(s) => s.len(),
        }
    }
}

pub struct Entry {
    pub key: Vec<u8>,
    pub val: Value,
    heap_idx: Option<usize>,
}

#[derive(Default)]
pub struct Db {
    entries: SlotMap<EntryId, Entry>,
    index: HMap<Vec<u8>, EntryId>,
    ttl: Vec<TtlItem<EntryId>>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        let &id = self.index.get(key)?;
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Entry> {
        let &id = self.index.get(key)?;
        self.entries.get_mut(id)
    }

    /// Insert a key assumed absent; callers replace via [`Db::remove`]
    /// first so the old value can be disposed of deliberately.
    pub fn insert(&mut self, key: Vec<u8>, val: Value) {
        debug_assert!(!self.index.contains(&key));
        let id = self.entries.insert(Entry {
            key: key.clone(),
            val,
            heap_idx: None,
        });
        self.index.insert(key, id);
    }

    /// Detach an entry from the index and the TTL heap, returning it
    /// whole so the caller decides how to drop it.
    pub fn remove(&mut self, key: &[u8]) -> Option<Entry> {
        let id = self.index.remove(key)?;
        self.detach_ttl(id);
        self.entries.remove(id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.index.keys()
    }

    /// Schedule the key to expire at `at` (monotonic ms). False when the
    /// key does not exist.
    pub fn set_ttl(&mut self, key: &[u8], at: u64) -> bool {
        let Some(&id) = self.index.get(key) else {
            return false;
        };
        let heap_pos = self.entries[id].heap_idx;
        let (ttl, entries) = (&mut self.ttl, &mut self.entries);
        let mut track = |id: EntryId, pos: usize| entries[id].heap_idx = Some(pos);
        match heap_pos {
            Some(pos) => {
                ttl[pos].at = at;
                heap::fix(ttl, pos, &mut track);
            }
            None => heap::push(ttl, TtlItem { at, id }, &mut track),
        }
        true
    }

    /// Drop any pending expiration. False when the key does not exist.
    pub fn clear_ttl(&mut self, key: &[u8]) -> bool {
        let Some(&id) = self.index.get(key) else {
            return false;
        };
        self.detach_ttl(id);
        true
    }

    /// `None`: no such key. `Some(None)`: key without a TTL.
    /// `Some(Some(ms))`: milliseconds until expiry (0 if already due).
    pub fn ttl_remaining(&self, key: &[u8], now: u64) -> Option<Option<u64>> {
        let &id = self.index.get(key)?;
        let entry = &self.entries[id];
        Some(
            entry
                .heap_idx
                .map(|pos| self.ttl[pos].at.saturating_sub(now)),
        )
    }

    /// Earliest pending deadline, for the event loop's poll timeout.
    pub fn next_expiry(&self) -> Option<u64> {
        self.ttl.first().map(|item| item.at)
    }

    /// Reap entries whose deadline has passed, up to the per-tick quota.
    /// Returns the detached entries so the caller routes their disposal.
    pub fn process_expirations(&mut self, now: u64) -> Vec<Entry> {
        let mut expired = Vec::new();
        while expired.len() < EXPIRE_QUOTA {
            match self.ttl.first() {
                Some(front) if front.at <= now => {}
                _ => break,
            }
            let id = self.ttl[0].id;
            let (ttl, entries) = (&mut self.ttl, &mut self.entries);
            heap::remove(ttl, 0, &mut |id, pos| entries[id].heap_idx = Some(pos));
            let mut entry = self.entries.remove(id).expect("heap id is live");
            entry.heap_idx = None;
            self.index.remove(&entry.key);
            expired.push(entry);
        }
        expired
    }

    fn detach_ttl(&mut self, id: EntryId) {
        let Some(pos) = self.entries[id].heap_idx.take() else {
            return;
        };
        let (ttl, entries) = (&mut self.ttl, &mut self.entries);
        heap::remove(ttl, pos, &mut |id, pos| entries[id].heap_idx = Some(pos));
    }
}
