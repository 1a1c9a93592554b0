/// Reorder buffer for batch results.
///
/// Batches complete in any order but are persisted strictly by sequence
/// number. Completed batches wait here until every earlier batch is in.
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct BatchBuffer<T> {
    /// Completed batches, indexed by sequence number
    ready: BTreeMap<u64, T>,

    /// Sequence number of the next batch to persist
    next: u64,
}

impl<T> Default for BatchBuffer<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> BatchBuffer<T> {
    pub fn new(next: u64) -> Self {
        Self {
            ready: BTreeMap::new(),
            next,
        }
    }

    /// Add a completed batch. Results for already persisted sequence
    /// numbers are dropped and returned to the caller.
    pub fn insert(&mut self, seq: u64, item: T) -> Option<T> {
        if seq < self.next {
            return Some(item);
        }
        self.ready.insert(seq, item)
    }

    /// Remove the batch that closes the persistence gap, if it arrived.
    ///
    /// The cursor does not move until [`BatchBuffer::advance`] is called,
    /// so a batch that fails to persist can be retried under the same
    /// sequence number.
    pub fn take_ready(&mut self) -> Option<(u64, T)> {
        let item = self.ready.remove(&self.next)?;
        Some((self.next, item))
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }

    pub fn next_seq(&self) -> u64 {
        self.next
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.ready.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Drop everything and restart at `next`.
    pub fn reset(&mut self, next: u64) {
        self.ready.clear();
        self.next = next;
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::mem::take(&mut self.ready).into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_releases_only_contiguous_prefix() {
        let mut buffer = BatchBuffer::new(0);
        assert_eq!(buffer.insert(2, "c"), None);
        assert_eq!(buffer.insert(1, "b"), None);
        assert_eq!(buffer.take_ready(), None);

        buffer.insert(0, "a");
        let mut persisted = Vec::new();
        while let Some((seq, item)) = buffer.take_ready() {
            persisted.push((seq, item));
            buffer.advance();
        }

        assert_eq!(persisted, vec![(0, "a"), (1, "b"), (2, "c")]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_seq(), 3);
    }

    #[test]
    fn test_failed_persist_keeps_cursor() {
        let mut buffer = BatchBuffer::new(5);
        buffer.insert(5, 50);
        let (seq, item) = buffer.take_ready().unwrap();
        assert_eq!(buffer.next_seq(), seq);

        buffer.insert(seq, item);
        assert!(buffer.contains(5));
    }

    #[test]
    fn test_stale_batch_is_returned() {
        let mut buffer = BatchBuffer::new(3);
        assert_eq!(buffer.insert(1, "old"), Some("old"));
        assert_eq!(buffer.len(), 0);

        buffer.insert(4, "later");
        buffer.reset(0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_seq(), 0);
    }
}
