//! Incrementally-resized chained hash table.
//!
//! Two generations of power-of-two bucket arrays: inserts always land in
//! the newer one, and once its load factor crosses [`MAX_LOAD_FACTOR`]
//! the whole newer generation is demoted to `older` and a doubled array
//! takes its place. Every subsequent mutating call migrates up to
//! [`REHASH_WORK`] chain nodes across, so no single operation ever pays
//! for a full rehash. Backs the global keyspace as well as the HASH and
//! SET value types.

use crate::hash::str_hash;

/// Chaining load factor that triggers a generation swap. Values above 1
/// are fine because buckets hold chains, not single slots.
const MAX_LOAD_FACTOR: usize = 8;
/// Migration steps performed per mutating call while a resize is in
/// flight.
const REHASH_WORK: usize = 128;

struct Node<K, V> {
    hcode: u64,
    key: K,
    val: V,
    next: Option<Box<Node<K, V>>>,
}

struct HTab<K, V> {
    slots: Vec<Option<Box<Node<K, V>>>>,
    mask: usize,
    size: usize,
}

impl<K: AsRef<[u8]> + Eq, V> HTab<K, V> {
    fn unallocated() -> Self {
        Self {
            slots: Vec::new(),
            mask: 0,
            size: 0,
        }
    }

    fn with_buckets(n: usize) -> Self {
        assert!(n.is_power_of_two());
        let mut slots = Vec::with_capacity(n);
        slots.resize_with(n, || None);
        Self {
            slots,
            mask: n - 1,
            size: 0,
        }
    }

    fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    fn insert(&mut self, node: Box<Node<K, V>>) {
        let pos = node.hcode as usize & self.mask;
        let mut node = node;
        node.next = self.slots[pos].take();
        self.slots[pos] = Some(node);
        self.size += 1;
    }

    /// The link (`&mut Option<Box<Node>>`) pointing at the matching node,
    /// so the caller can unlink or mutate in place.
    fn find_link(&mut self, hcode: u64, key: &[u8]) -> Option<&mut Option<Box<Node<K, V>>>> {
        if !self.is_allocated() {
            return None;
        }
        let pos = hcode as usize & self.mask;
        let mut link = &mut self.slots[pos];
        while link
            .as_ref()
            .is_some_and(|node| !(node.hcode == hcode && node.key.as_ref() == key))
        {
            link = &mut link.as_mut().unwrap().next;
        }
        if link.is_some() { Some(link) } else { None }
    }

    fn get(&self, hcode: u64, key: &[u8]) -> Option<&Node<K, V>> {
        if !self.is_allocated() {
            return None;
        }
        let pos = hcode as usize & self.mask;
        let mut cur = self.slots[pos].as_deref();
        while let Some(node) = cur {
            if node.hcode == hcode && node.key.as_ref() == key {
                return Some(node);
            }
            cur = node.next.as_deref();
        }
        None
    }

    fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots
            .iter()
            .flat_map(|slot| ChainIter { cur: slot.as_deref() })
    }
}

struct ChainIter<'a, K, V> {
    cur: Option<&'a Node<K, V>>,
}

impl<'a, K, V> Iterator for ChainIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cur?;
        self.cur = node.next.as_deref();
        Some((&node.key, &node.val))
    }
}

pub struct HMap<K, V> {
    newer: HTab<K, V>,
    older: HTab<K, V>,
    migrate_pos: usize,
}

impl<K: AsRef<[u8]> + Eq, V> Default for HMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: AsRef<[u8]> + Eq, V> HMap<K, V> {
    pub fn new() -> Self {
        Self {
            newer: HTab::unallocated(),
            older: HTab::unallocated(),
            migrate_pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.newer.size + self.older.size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a key assumed absent. Duplicates are not rejected here;
    /// callers check with [`HMap::get`] first.
    pub fn insert(&mut self, key: K, val: V) {
        if !self.newer.is_allocated() {
            self.newer = HTab::with_buckets(4);
        }
        let hcode = str_hash(key.as_ref());
        self.newer.insert(Box::new(Node {
            hcode,
            key,
            val,
            next: None,
        }));

        if !self.older.is_allocated() {
            let threshold = (self.newer.mask + 1) * MAX_LOAD_FACTOR;
            if self.newer.size >= threshold {
                self.start_resize();
            }
        }
        self.help_rehash();
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let hcode = str_hash(key);
        self.newer
            .get(hcode, key)
            .or_else(|| self.older.get(hcode, key))
            .map(|node| &node.val)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let hcode = str_hash(key);
        if let Some(link) = self.newer.find_link(hcode, key) {
            return link.as_mut().map(|node| &mut node.val);
        }
        self.older
            .find_link(hcode, key)?
            .as_mut()
            .map(|node| &mut node.val)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let hcode = str_hash(key);
        let removed = Self::unlink(&mut self.newer, hcode, key)
            .or_else(|| Self::unlink(&mut self.older, hcode, key));
        self.help_rehash();
        removed.map(|node| node.val)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// All live pairs, across both generations.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.newer.iter().chain(self.older.iter())
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    /// True while a resize is being paid off.
    pub fn is_migrating(&self) -> bool {
        self.older.is_allocated()
    }

    fn unlink(tab: &mut HTab<K, V>, hcode: u64, key: &[u8]) -> Option<Box<Node<K, V>>> {
        let link = tab.find_link(hcode, key)?;
        let mut node = link.take()?;
        *link = node.next.take();
        tab.size -= 1;
        Some(node)
    }

    fn start_resize(&mut self) {
        debug_assert!(!self.older.is_allocated());
        let doubled = HTab::with_buckets((self.newer.mask + 1) * 2);
        self.older = std::mem::replace(&mut self.newer, doubled);
        self.migrate_pos = 0;
    }

    fn help_rehash(&mut self) {
        let mut nwork = 0;
        while nwork < REHASH_WORK && self.older.size > 0 {
            // Pop one chain head at the cursor; skip drained buckets.
            let slot = &mut self.older.slots[self.migrate_pos];
            let Some(mut node) = slot.take() else {
                self.migrate_pos += 1;
                continue;
            };
            *slot = node.next.take();
            self.older.size -= 1;
            self.newer.insert(node);
            nwork += 1;
        }
        if self.older.is_allocated() && self.older.size == 0 {
            self.older = HTab::unallocated();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> Vec<u8> {
        format!("key:{i}").into_bytes()
    }

    #[test]
    fn basic_insert_get_remove() {
        let mut map: HMap<Vec<u8>, u32> = HMap::new();
        assert!(map.get(b"missing").is_none());
        map.insert(b"a".to_vec(), 1);
        map.insert(b"b".to_vec(), 2);
        assert_eq!(map.get(b"a"), Some(&1));
        assert_eq!(map.get(b"b"), Some(&2));
        assert_eq!(map.len(), 2);
        assert_eq!(map.remove(b"a"), Some(1));
        assert!(map.get(b"a").is_none());
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(b"a"), None);
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut map: HMap<Vec<u8>, u32> = HMap::new();
        map.insert(b"n".to_vec(), 1);
        *map.get_mut(b"n").unwrap() += 41;
        assert_eq!(map.get(b"n"), Some(&42));
    }

    #[test]
    fn correct_during_and_after_migration() {
        let mut map: HMap<Vec<u8>, usize> = HMap::new();
        let n = 4096;
        let mut saw_migration = false;
        for i in 0..n {
            map.insert(key(i), i);
            saw_migration |= map.is_migrating();
            // Spot-check lookups mid-migration.
            if i % 97 == 0 {
                for probe in [0, i / 2, i] {
                    assert_eq!(map.get(&key(probe)), Some(&probe), "probe {probe} at {i}");
                }
                assert_eq!(map.len(), i + 1);
            }
        }
        assert!(saw_migration);

        // Delete every other key, again checking mid-flight.
        for i in (0..n).step_by(2) {
            assert_eq!(map.remove(&key(i)), Some(i));
        }
        assert_eq!(map.len(), n / 2);
        for i in 0..n {
            let expect = if i % 2 == 0 { None } else { Some(&i) };
            assert_eq!(map.get(&key(i)), expect);
        }

        // Enough further inserts drive any in-flight migration to completion.
        let mut i = n;
        while map.is_migrating() {
            map.insert(key(i), i);
            i += 1;
        }
        assert!(!map.is_migrating());
        for probe in [1, n - 1] {
            assert_eq!(map.get(&key(probe)), Some(&probe));
        }
    }

    #[test]
    fn keys_cover_both_generations() {
        let mut map: HMap<Vec<u8>, ()> = HMap::new();
        // 32 inserts into a 4-bucket table forces a swap at load factor 8,
        // leaving keys split across generations right at the boundary.
        for i in 0..33 {
            map.insert(key(i), ());
        }
        assert!(map.is_migrating() || map.len() == 33);
        let mut keys: Vec<_> = map.keys().cloned().collect();
        keys.sort();
        let mut expect: Vec<_> = (0..33).map(key).collect();
        expect.sort();
        assert_eq!(keys, expect);
    }

    #[test]
    fn last_write_wins_via_get_mut() {
        let mut map: HMap<Vec<u8>, String> = HMap::new();
        for i in 0..1000 {
            let k = key(i % 50);
            match map.get_mut(&k) {
                Some(v) => *v = format!("v{i}"),
                None => map.insert(k, format!("v{i}")),
            }
        }
        assert_eq!(map.len(), 50);
        assert_eq!(map.get(&key(49)).map(String::as_str), Some("v999"));
    }
}
