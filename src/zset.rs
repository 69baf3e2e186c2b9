//! Sorted set: an AVL tree ordered by (score, name) paired with a hash
//! index from member name to tree node.
//!
//! The tree answers range and rank queries; the index makes score
//! lookup, update and removal O(log n) without a tree search by name.

use ordered_float::OrderedFloat;

use crate::avl::{AvlId, AvlTree};
use crate::hmap::HMap;

/// A member with its score. `Ord` derives as score-then-name, which is
/// exactly the tree order the range queries rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ZItem {
    pub score: OrderedFloat<f64>,
    pub name: Vec<u8>,
}

#[derive(Default)]
pub struct ZSet {
    tree: AvlTree<ZItem>,
    by_name: HMap<Vec<u8>, AvlId>,
}

impl ZSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Add a member or update its score. Returns true when the member is
    /// new.
    pub fn insert(&mut self, score: f64, name: &[u8]) -> bool {
        if let Some(&id) = self.by_name.get(name) {
            // Re-scoring moves the node within the tree, so it is a
            // remove + insert. The removal may relocate another member's
            // item into the vacated id; repair that member's index entry.
            let old = self.tree.remove(id);
            self.repair_relocation(id);
            let new_id = self.tree.insert(ZItem {
                score: OrderedFloat(score),
                name: old.name,
            });
            *self.by_name.get_mut(name).expect("member is indexed") = new_id;
            false
        } else {
            let id = self.tree.insert(ZItem {
                score: OrderedFloat(score),
                name: name.to_vec(),
            });
            self.by_name.insert(name.to_vec(), id);
            true
        }
    }

    /// Remove a member. Returns true when it existed.
    pub fn remove(&mut self, name: &[u8]) -> bool {
        let Some(id) = self.by_name.remove(name) else {
            return false;
        };
        self.tree.remove(id);
        self.repair_relocation(id);
        true
    }

    pub fn score(&self, name: &[u8]) -> Option<f64> {
        let &id = self.by_name.get(name)?;
        Some(self.tree.get(id)?.score.0)
    }

    /// First member with `(score, name) >= (score, name)` in tree order.
    pub fn seekge(&self, score: f64, name: &[u8]) -> Option<AvlId> {
        self.tree.lower_bound(&ZItem {
            score: OrderedFloat(score),
            name: name.to_vec(),
        })
    }

    /// Rank-walk `delta` positions from `id`.
    pub fn offset(&self, id: AvlId, delta: i64) -> Option<AvlId> {
        self.tree.offset(id, delta)
    }

    pub fn item(&self, id: AvlId) -> Option<&ZItem> {
        self.tree.get(id)
    }

    /// After a tree removal, the in-order successor's item may now live
    /// at the removed id. Point its name entry back at the right node.
    fn repair_relocation(&mut self, id: AvlId) {
        if let Some(moved) = self.tree.get(id) {
            let slot = self
                .by_name
                .get_mut(&moved.name)
                .expect("relocated member is indexed");
            *slot = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_range(zset: &ZSet, score: f64, name: &[u8], offset: i64, limit: usize) -> Vec<(f64, String)> {
        let mut out = Vec::new();
        let mut cur = zset
            .seekge(score, name)
            .and_then(|id| zset.offset(id, offset));
        while let Some(id) = cur {
            if out.len() >= limit {
                break;
            }
            let item = zset.item(id).unwrap();
            out.push((item.score.0, String::from_utf8(item.name.clone()).unwrap()));
            cur = zset.offset(id, 1);
        }
        out
    }

    #[test]
    fn insert_update_score_remove() {
        let mut zset = ZSet::new();
        assert!(zset.insert(1.0, b"alice"));
        assert!(zset.insert(2.0, b"bob"));
        assert!(!zset.insert(5.0, b"alice"));
        assert_eq!(zset.len(), 2);
        assert_eq!(zset.score(b"alice"), Some(5.0));
        assert_eq!(zset.score(b"bob"), Some(2.0));
        assert!(zset.remove(b"alice"));
        assert!(!zset.remove(b"alice"));
        assert_eq!(zset.score(b"alice"), None);
        assert_eq!(zset.len(), 1);
    }

    #[test]
    fn range_query_orders_by_score_then_name() {
        let mut zset = ZSet::new();
        for (score, name) in [(1.0, "n1"), (2.0, "n3"), (2.0, "n2"), (3.0, "n4"), (1.5, "n0")] {
            zset.insert(score, name.as_bytes());
        }
        let all = collect_range(&zset, f64::NEG_INFINITY, b"", 0, 100);
        assert_eq!(
            all,
            vec![
                (1.0, "n1".into()),
                (1.5, "n0".into()),
                (2.0, "n2".into()),
                (2.0, "n3".into()),
                (3.0, "n4".into()),
            ]
        );
        // Seek lands on the first item >= (2.0, "").
        let tail = collect_range(&zset, 2.0, b"", 0, 2);
        assert_eq!(tail, vec![(2.0, "n2".into()), (2.0, "n3".into())]);
        // Name breaks the tie within equal scores.
        let after_n2 = collect_range(&zset, 2.0, b"n2\0", 0, 10);
        assert_eq!(after_n2, vec![(2.0, "n3".into()), (3.0, "n4".into())]);
    }

    #[test]
    fn offset_pages_through_results() {
        let mut zset = ZSet::new();
        for i in 0..50 {
            zset.insert(i as f64, format!("m{i:02}").as_bytes());
        }
        let page = collect_range(&zset, 0.0, b"", 20, 5);
        let expect: Vec<(f64, String)> =
            (20..25).map(|i| (i as f64, format!("m{i:02}"))).collect();
        assert_eq!(page, expect);
        // Offset past the end finds nothing.
        assert!(collect_range(&zset, 0.0, b"", 50, 5).is_empty());
    }

    #[test]
    fn index_survives_node_relocation() {
        // Removals that trigger the successor item-swap must leave every
        // surviving member reachable by name with its own score.
        let mut zset = ZSet::new();
        let n = 64;
        for i in 0..n {
            zset.insert(i as f64, format!("m{i}").as_bytes());
        }
        for i in (0..n).step_by(3) {
            assert!(zset.remove(format!("m{i}").as_bytes()));
        }
        for i in 0..n {
            let name = format!("m{i}");
            let expect = if i % 3 == 0 { None } else { Some(i as f64) };
            assert_eq!(zset.score(name.as_bytes()), expect, "member {name}");
        }
        // Score updates go through the same remove path.
        for i in 0..n {
            if i % 3 != 0 {
                zset.insert(1000.0 + i as f64, format!("m{i}").as_bytes());
            }
        }
        for i in 0..n {
            if i % 3 != 0 {
                assert_eq!(
                    zset.score(format!("m{i}").as_bytes()),
                    Some(1000.0 + i as f64)
                );
            }
        }
    }

    #[test]
    fn negative_scores_and_nan_free_ordering() {
        let mut zset = ZSet::new();
        zset.insert(-1.5, b"neg");
        zset.insert(0.0, b"zero");
        zset.insert(f64::INFINITY, b"inf");
        let all = collect_range(&zset, f64::NEG_INFINITY, b"", 0, 10);
        assert_eq!(all[0].1, "neg");
        assert_eq!(all[2].1, "inf");
    }
}
