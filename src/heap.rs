//! Array-backed min-heap driving the TTL schedule.
//!
//! Items carry an owner id; every time an item changes position the move
//! is reported through a `track` callback so the owner's stored heap
//! index always equals the item's true array position. After any single
//! swap only one direction of the heap property can be violated, so
//! [`fix`] sifts whichever way is needed.

#[derive(Debug, Clone, Copy)]
pub struct TtlItem<I> {
    /// Absolute deadline in monotonic milliseconds.
    pub at: u64,
    pub id: I,
}

fn left(pos: usize) -> usize {
    pos * 2 + 1
}

fn right(pos: usize) -> usize {
    pos * 2 + 2
}

fn parent(pos: usize) -> usize {
    (pos - 1) / 2
}

/// Append an item and sift it up.
pub fn push<I: Copy>(heap: &mut Vec<TtlItem<I>>, item: TtlItem<I>, track: &mut impl FnMut(I, usize)) {
    heap.push(item);
    let pos = heap.len() - 1;
    track(item.id, pos);
    sift_up(heap, pos, track);
}

/// Restore the heap property at `pos` after its deadline changed.
pub fn fix<I: Copy>(heap: &mut [TtlItem<I>], pos: usize, track: &mut impl FnMut(I, usize)) {
    if pos > 0 && heap[parent(pos)].at > heap[pos].at {
        sift_up(heap, pos, track);
    } else {
        sift_down(heap, pos, track);
    }
}

/// Remove the item at `pos` by swapping in the last element.
///
/// The caller clears the removed owner's index itself; only the moved
/// survivor is reported through `track`.
pub fn remove<I: Copy>(
    heap: &mut Vec<TtlItem<I>>,
    pos: usize,
    track: &mut impl FnMut(I, usize),
) -> TtlItem<I> {
    assert!(pos < heap.len());
    let last = heap.len() - 1;
    heap.swap(pos, last);
    let removed = heap.pop().unwrap();
    if pos < heap.len() {
        track(heap[pos].id, pos);
        fix(heap, pos, track);
    }
    removed
}

fn sift_up<I: Copy>(heap: &mut [TtlItem<I>], mut pos: usize, track: &mut impl FnMut(I, usize)) {
    while pos > 0 && heap[parent(pos)].at > heap[pos].at {
        let up = parent(pos);
        heap.swap(pos, up);
        track(heap[pos].id, pos);
        pos = up;
    }
    track(heap[pos].id, pos);
}

fn sift_down<I: Copy>(heap: &mut [TtlItem<I>], mut pos: usize, track: &mut impl FnMut(I, usize)) {
    let len = heap.len();
    loop {
        let mut min_pos = pos;
        if left(pos) < len && heap[left(pos)].at < heap[min_pos].at {
            min_pos = left(pos);
        }
        if right(pos) < len && heap[right(pos)].at < heap[min_pos].at {
            min_pos = right(pos);
        }
        if min_pos == pos {
            break;
        }
        heap.swap(pos, min_pos);
        track(heap[pos].id, pos);
        pos = min_pos;
    }
    track(heap[pos].id, pos);
}
