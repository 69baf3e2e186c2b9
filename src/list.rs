//! Arena-backed doubly-linked list.
//!
//! The server keeps one of these per timeout class (idle/read/write);
//! connections sit in insertion order, so the front is always the next
//! deadline and refreshing a connection is detach + push_back. Links are
//! slotmap handles rather than pointers, so a stale handle is a `None`,
//! never a dangling access.

use slotmap::{SlotMap, new_key_type};

new_key_type! {
    pub struct LinkId;
}

struct Node<T> {
    val: T,
    prev: Option<LinkId>,
    next: Option<LinkId>,
}

pub struct DList<T> {
    nodes: SlotMap<LinkId, Node<T>>,
    head: Option<LinkId>,
    tail: Option<LinkId>,
}

impl<T> Default for DList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DList<T> {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn push_back(&mut self, val: T) -> LinkId {
        let id = self.nodes.insert(Node {
            val,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Unlink a node wherever it sits. Stale handles are a no-op `None`.
    pub fn detach(&mut self, id: LinkId) -> Option<T> {
        let node = self.nodes.remove(id)?;
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }
        Some(node.val)
    }

    pub fn front(&self) -> Option<(LinkId, &T)> {
        let id = self.head?;
        Some((id, &self.nodes[id].val))
    }

    /// Refresh: move an existing node to the back, keeping its value.
    pub fn move_to_back(&mut self, id: LinkId) -> Option<LinkId> {
        let val = self.detach(id)?;
        Some(self.push_back(val))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T>(list: &mut DList<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some((id, _)) = list.front() {
            out.push(list.detach(id).unwrap());
        }
        out
    }

    #[test]
    fn fifo_order() {
        let mut list = DList::new();
        assert!(list.is_empty());
        for i in 0..5 {
            list.push_back(i);
        }
        assert_eq!(list.len(), 5);
        assert_eq!(drain(&mut list), vec![0, 1, 2, 3, 4]);
        assert!(list.is_empty());
    }

    #[test]
    fn detach_middle_and_ends() {
        let mut list = DList::new();
        let a = list.push_back('a');
        let b = list.push_back('b');
        let c = list.push_back('c');
        assert_eq!(list.detach(b), Some('b'));
        assert_eq!(list.front(), Some((a, &'a')));
        assert_eq!(list.detach(a), Some('a'));
        assert_eq!(list.front(), Some((c, &'c')));
        assert_eq!(list.detach(c), Some('c'));
        assert!(list.is_empty());
        // Stale handle after removal.
        assert_eq!(list.detach(b), None);
    }

    #[test]
    fn move_to_back_refreshes() {
        let mut list = DList::new();
        let a = list.push_back("a");
        let _b = list.push_back("b");
        let a2 = list.move_to_back(a).unwrap();
        assert_eq!(list.front().map(|(_, v)| *v), Some("b"));
        assert_eq!(list.detach(a), None);
        assert_eq!(list.detach(a2), Some("a"));
    }
}
