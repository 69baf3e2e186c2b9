//! Size-augmented AVL tree over a slotmap arena.
//!
//! Every link (parent, children) is an arena handle rather than a
//! pointer, so external indexes can hold node ids safely across
//! rebalancing. Each node carries its subtree size, which is what makes
//! rank/offset queries O(log n) instead of a scan.

use slotmap::{SlotMap, new_key_type};

new_key_type! {
    pub struct AvlId;
}

struct AvlNode<T> {
    item: T,
    parent: Option<AvlId>,
    left: Option<AvlId>,
    right: Option<AvlId>,
    height: u32,
    count: u32,
}

pub struct AvlTree<T> {
    nodes: SlotMap<AvlId, AvlNode<T>>,
    root: Option<AvlId>,
}

impl<T> Default for AvlTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AvlTree<T> {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            root: None,
        }
    }

    pub fn len(&self) -> usize {
        self.count(self.root) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, id: AvlId) -> Option<&T> {
        self.nodes.get(id).map(|node| &node.item)
    }

    /// Leftmost node: the smallest item.
    pub fn first(&self) -> Option<AvlId> {
        let mut cur = self.root?;
        while let Some(left) = self.nodes[cur].left {
            cur = left;
        }
        Some(cur)
    }

    /// The node `delta` positions away in sorted order.
    ///
    /// Walks by running rank: descend into a child when the target lies
    /// within its subtree span, otherwise climb, adjusting the rank by
    /// the subtree crossed. `None` when the walk would leave the tree.
    pub fn offset(&self, start: AvlId, delta: i64) -> Option<AvlId> {
        self.nodes.get(start)?;
        let mut node = start;
        let mut pos = 0i64;
        while pos != delta {
            let rc = self.count(self.nodes[node].right) as i64;
            let lc = self.count(self.nodes[node].left) as i64;
            if pos < delta && delta <= pos + rc {
                // Target is inside the right subtree.
                node = self.nodes[node].right.unwrap();
                pos += self.count(self.nodes[node].left) as i64 + 1;
            } else if pos > delta && delta >= pos - lc {
                node = self.nodes[node].left.unwrap();
                pos -= self.count(self.nodes[node].right) as i64 + 1;
            } else {
                let parent = self.nodes[node].parent?;
                if self.nodes[parent].right == Some(node) {
                    pos -= lc + 1;
                } else {
                    pos += rc + 1;
                }
                node = parent;
            }
        }
        Some(node)
    }

    fn height(&self, id: Option<AvlId>) -> u32 {
        id.map_or(0, |id| self.nodes[id].height)
    }

    fn count(&self, id: Option<AvlId>) -> u32 {
        id.map_or(0, |id| self.nodes[id].count)
    }

    fn update(&mut self, id: AvlId) {
        let node = &self.nodes[id];
        let (l, r) = (node.left, node.right);
        let height = 1 + self.height(l).max(self.height(r));
        let count = 1 + self.count(l) + self.count(r);
        let node = &mut self.nodes[id];
        node.height = height;
        node.count = count;
    }

    /// Point `parent`'s child link (or the root) at `new` instead of `old`.
    fn relink(&mut self, parent: Option<AvlId>, old: AvlId, new: Option<AvlId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                if self.nodes[p].left == Some(old) {
                    self.nodes[p].left = new;
                } else {
                    debug_assert_eq!(self.nodes[p].right, Some(old));
                    self.nodes[p].right = new;
                }
            }
        }
    }

    fn rot_left(&mut self, node: AvlId) -> AvlId {
        let pivot = self.nodes[node].right.expect("left rotation needs a right child");
        let inner = self.nodes[pivot].left;
        let parent = self.nodes[node].parent;

        self.nodes[node].right = inner;
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(node);
        }
        self.nodes[pivot].left = Some(node);
        self.nodes[node].parent = Some(pivot);
        self.nodes[pivot].parent = parent;
        self.relink(parent, node, Some(pivot));

        self.update(node);
        self.update(pivot);
        pivot
    }

    fn rot_right(&mut self, node: AvlId) -> AvlId {
        let pivot = self.nodes[node].left.expect("right rotation needs a left child");
        let inner = self.nodes[pivot].right;
        let parent = self.nodes[node].parent;

        self.nodes[node].left = inner;
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(node);
        }
        self.nodes[pivot].right = Some(node);
        self.nodes[node].parent = Some(pivot);
        self.nodes[pivot].parent = parent;
        self.relink(parent, node, Some(pivot));

        self.update(node);
        self.update(pivot);
        pivot
    }

    /// Left subtree is two levels taller; the inner (left-right) case
    /// needs a pre-rotation of the child.
    fn fix_left(&mut self, node: AvlId) -> AvlId {
        let left = self.nodes[node].left.unwrap();
        if self.height(self.nodes[left].left) < self.height(self.nodes[left].right) {
            self.rot_left(left);
        }
        self.rot_right(node)
    }

    fn fix_right(&mut self, node: AvlId) -> AvlId {
        let right = self.nodes[node].right.unwrap();
        if self.height(self.nodes[right].right) < self.height(self.nodes[right].left) {
            self.rot_right(right);
        }
        self.rot_left(node)
    }

    /// Walk from `node` to the root, refreshing the augmentation and
    /// rotating wherever sibling heights differ by two.
    fn fix(&mut self, mut node: AvlId) {
        loop {
            self.update(node);
            let lh = self.height(self.nodes[node].left);
            let rh = self.height(self.nodes[node].right);
            let subroot = if lh == rh + 2 {
                self.fix_left(node)
            } else if lh + 2 == rh {
                self.fix_right(node)
            } else {
                node
            };
            match self.nodes[subroot].parent {
                Some(parent) => node = parent,
                None => {
                    self.root = Some(subroot);
                    return;
                }
            }
        }
    }

    /// Remove a node with at most one child.
    fn del_easy(&mut self, id: AvlId) -> AvlNode<T> {
        let node = self.nodes.remove(id).expect("deleting a live node");
        debug_assert!(node.left.is_none() || node.right.is_none());
        let child = node.left.or(node.right);
        if let Some(child) = child {
            self.nodes[child].parent = node.parent;
        }
        self.relink(node.parent, id, child);
        if let Some(parent) = node.parent {
            self.fix(parent);
        }
        node
    }
}

impl<T: Ord> AvlTree<T> {
    /// Insert an item; equal items land to the right of their twins.
    pub fn insert(&mut self, item: T) -> AvlId {
        let mut parent = None;
        let mut cur = self.root;
        let mut went_left = false;
        while let Some(node) = cur {
            parent = Some(node);
            went_left = item < self.nodes[node].item;
            cur = if went_left {
                self.nodes[node].left
            } else {
                self.nodes[node].right
            };
        }

        let id = self.nodes.insert(AvlNode {
            item,
            parent,
            left: None,
            right: None,
            height: 1,
            count: 1,
        });
        match parent {
            None => self.root = Some(id),
            Some(p) => {
                if went_left {
                    self.nodes[p].left = Some(id);
                } else {
                    self.nodes[p].right = Some(id);
                }
                self.fix(id);
            }
        }
        id
    }

    /// Remove by id, returning the item.
    ///
    /// A two-child victim swaps items with its in-order successor and
    /// the successor's node is unlinked instead, so the successor's item
    /// is afterwards reachable at the victim's id. Callers that index
    /// nodes by id (the zset name index) observe the relocation with
    /// [`AvlTree::get`] on the removed id and repair their mapping.
    pub fn remove(&mut self, id: AvlId) -> T {
        let node = &self.nodes[id];
        if node.left.is_some() && node.right.is_some() {
            let mut succ = node.right.unwrap();
            while let Some(left) = self.nodes[succ].left {
                succ = left;
            }
            let [a, b] = self
                .nodes
                .get_disjoint_mut([id, succ])
                .expect("victim and successor are distinct");
            std::mem::swap(&mut a.item, &mut b.item);
            self.del_easy(succ).item
        } else {
            self.del_easy(id).item
        }
    }

    /// Smallest node whose item is `>= key`.
    pub fn lower_bound(&self, key: &T) -> Option<AvlId> {
        let mut candidate = None;
        let mut cur = self.root;
        while let Some(node) = cur {
            if self.nodes[node].item < *key {
                cur = self.nodes[node].right;
            } else {
                candidate = Some(node);
                cur = self.nodes[node].left;
            }
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl<T: Ord> AvlTree<T> {
        fn in_order(&self) -> Vec<&T> {
            let mut out = Vec::with_capacity(self.len());
            let mut cur = self.first();
            while let Some(id) = cur {
                out.push(self.get(id).unwrap());
                cur = self.offset(id, 1);
            }
            out
        }

        /// Recursively verify order, heights, counts and balance.
        fn check_invariants(&self) {
            fn walk<T: Ord>(tree: &AvlTree<T>, id: Option<AvlId>) -> (u32, u32) {
                let Some(id) = id else { return (0, 0) };
                let node = &tree.nodes[id];
                let (lh, lc) = walk(tree, node.left);
                let (rh, rc) = walk(tree, node.right);
                assert!(lh.abs_diff(rh) <= 1, "unbalanced node");
                assert_eq!(node.height, 1 + lh.max(rh), "stale height");
                assert_eq!(node.count, 1 + lc + rc, "stale count");
                if let Some(left) = node.left {
                    assert!(tree.nodes[left].item <= node.item);
                    assert_eq!(tree.nodes[left].parent, Some(id));
                }
                if let Some(right) = node.right {
                    assert!(node.item <= tree.nodes[right].item);
                    assert_eq!(tree.nodes[right].parent, Some(id));
                }
                (node.height, node.count)
            }
            if let Some(root) = self.root {
                assert_eq!(self.nodes[root].parent, None);
            }
            walk(self, self.root);
        }
    }

    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn insert_keeps_sorted_order_and_invariants() {
        let mut tree = AvlTree::new();
        let mut state = 0x1234_5678_9abc_def0u64;
        let mut items = Vec::new();
        for _ in 0..500 {
            let v = xorshift(&mut state) % 10_000;
            items.push(v);
            tree.insert(v);
            if items.len() % 50 == 0 {
                tree.check_invariants();
            }
        }
        tree.check_invariants();
        items.sort();
        let got: Vec<u64> = tree.in_order().into_iter().copied().collect();
        assert_eq!(got, items);
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let mut tree = AvlTree::new();
        for i in 0..1024u32 {
            tree.insert(i);
        }
        tree.check_invariants();
        // A balanced tree of 1024 nodes has height 11 at most... allow AVL slack.
        assert!(tree.nodes[tree.root.unwrap()].height <= 15);
    }

    #[test]
    fn remove_one_and_two_child_nodes() {
        let mut tree = AvlTree::new();
        let mut ids = Vec::new();
        for i in 0..200u32 {
            ids.push((i, tree.insert(i)));
        }
        let mut state = 0xdead_beefu64;
        let mut live: Vec<u32> = (0..200).collect();
        // Delete in pseudo-random order; look ids up by value because a
        // two-child delete relocates the successor's item.
        while !live.is_empty() {
            let pick = (xorshift(&mut state) % live.len() as u64) as usize;
            let val = live.swap_remove(pick);
            let id = tree
                .lower_bound(&val)
                .expect("value still present");
            assert_eq!(tree.get(id), Some(&val));
            assert_eq!(tree.remove(id), val);
            if live.len() % 25 == 0 {
                tree.check_invariants();
            }
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn two_child_removal_relocates_successor() {
        let mut tree = AvlTree::new();
        let ids: Vec<AvlId> = (0..7u32).map(|i| tree.insert(i)).collect();
        // The root of 0..7 inserted ascending is 3 (two children).
        let root = tree.root.unwrap();
        let victim = *tree.get(root).unwrap();
        let succ_val = victim + 1;
        assert_eq!(tree.remove(root), victim);
        // The successor's item is now readable at the removed id.
        assert_eq!(tree.get(root), Some(&succ_val));
        tree.check_invariants();
        drop(ids);
    }

    #[test]
    fn offset_round_trips() {
        let mut tree = AvlTree::new();
        for i in 0..128i64 {
            tree.insert(i);
        }
        let start = tree.lower_bound(&40).unwrap();
        for k in [-40i64, -7, -1, 0, 1, 19, 87] {
            let there = tree.offset(start, k).expect("in range");
            assert_eq!(tree.get(there), Some(&(40 + k)));
            let back = tree.offset(there, -k).expect("in range");
            assert_eq!(back, start);
        }
        // Out of range in both directions.
        assert_eq!(tree.offset(start, 88), None);
        assert_eq!(tree.offset(start, -41), None);
    }

    #[test]
    fn lower_bound_edges() {
        let mut tree = AvlTree::new();
        for i in (0..100u32).step_by(10) {
            tree.insert(i);
        }
        assert_eq!(tree.get(tree.lower_bound(&0).unwrap()), Some(&0));
        assert_eq!(tree.get(tree.lower_bound(&41).unwrap()), Some(&50));
        assert_eq!(tree.get(tree.lower_bound(&90).unwrap()), Some(&90));
        assert_eq!(tree.lower_bound(&91), None);
    }
}
