//! Bounded FIFO between the frame selector and the persistence service.
//!
//! Push and pop never block: a full queue hands the item back, an empty
//! queue returns `None`. The queue is not synchronized on its own; it lives
//! next to the frame store under the same lock.

/// Rejected push. Carries the item back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull<T>(pub T);

impl<T> std::fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("hand-off queue full")
    }
}

impl<T: std::fmt::Debug> std::error::Error for QueueFull<T> {}

pub struct HandoffQueue<T> {
    entries: Vec<Option<T>>,
    front: usize,
    rear: usize,
    count: usize,
}

impl<T> HandoffQueue<T> {
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "hand-off queue needs at least one entry");
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            front: 0,
            rear: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.entries.len()
    }

    pub fn push(&mut self, item: T) -> Result<(), QueueFull<T>> {
        if self.is_full() {
            return Err(QueueFull(item));
        }
        self.entries[self.rear] = Some(item);
        self.rear = (self.rear + 1) % self.entries.len();
        self.count += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.entries[self.front].take();
        self.front = (self.front + 1) % self.entries.len();
        self.count -= 1;
        item
    }
}

impl<T> std::fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("capacity", &self.entries.len())
            .field("front", &self.front)
            .field("rear", &self.rear)
            .field("count", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_push_order_across_wrap() {
        let mut q = HandoffQueue::new(3);
        for round in 0..4 {
            q.push(round * 10).unwrap();
            q.push(round * 10 + 1).unwrap();
            assert_eq!(q.pop(), Some(round * 10));
            assert_eq!(q.pop(), Some(round * 10 + 1));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn full_push_returns_item_and_leaves_state() {
        let mut q = HandoffQueue::new(1);
        q.push("a").unwrap();
        assert_eq!(q.push("b"), Err(QueueFull("b")));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), None);
        assert_eq!(q.len(), 0);
    }
}
