//! In-process bounded buffer.

use super::Buffer;
use crate::core::Item;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A bounded FIFO guarded by a mutex.
///
/// Each operation holds the lock for one bulk transfer, which keeps reads
/// and writes atomic with respect to each other.
#[derive(Debug)]
pub struct BoundedBuffer {
    queue: Mutex<VecDeque<Item>>,
    capacity: usize,
}

impl BoundedBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Creates a buffer prefilled with `items`, growing the capacity if the
    /// items would not fit.
    #[must_use]
    pub fn with_items(capacity: usize, items: impl IntoIterator<Item = Item>) -> Self {
        let queue: VecDeque<Item> = items.into_iter().collect();
        let capacity = capacity.max(queue.len());
        Self {
            queue: Mutex::new(queue),
            capacity,
        }
    }
}

impl Buffer for BoundedBuffer {
    fn read(&self) -> Option<Item> {
        self.queue.lock().pop_front()
    }

    fn read_exact(&self, count: usize) -> Option<Vec<Item>> {
        let mut queue = self.queue.lock();
        if queue.len() < count {
            return None;
        }
        Some(queue.drain(..count).collect())
    }

    fn read_all(&self) -> Vec<Item> {
        self.queue.lock().drain(..).collect()
    }

    fn write(&self, items: &mut VecDeque<Item>) -> usize {
        let mut queue = self.queue.lock();
        let room = self.capacity.saturating_sub(queue.len());
        let count = room.min(items.len());
        queue.extend(items.drain(..count));
        count
    }

    fn write_all(&self, items: Vec<Item>) -> Result<(), Vec<Item>> {
        let mut queue = self.queue.lock();
        if self.capacity.saturating_sub(queue.len()) < items.len() {
            return Err(items);
        }
        queue.extend(items);
        Ok(())
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_write_respects_capacity() {
        let buffer = BoundedBuffer::new(3);
        let mut items: VecDeque<Item> = (0..5).map(|i| json!(i)).collect();

        assert_eq!(buffer.write(&mut items), 3);
        assert_eq!(items.len(), 2);
        assert_eq!(buffer.room(), 0);
        assert_eq!(items.front(), Some(&json!(3)));
    }

    #[test]
    fn test_write_all_is_atomic() {
        let buffer = BoundedBuffer::new(2);
        buffer.write_all(vec![json!(1)]).unwrap();

        let rejected = buffer.write_all(vec![json!(2), json!(3)]).unwrap_err();
        assert_eq!(rejected.len(), 2);
        assert_eq!(buffer.size(), 1);
    }

    #[test]
    fn test_read_exact_is_all_or_nothing() {
        let buffer = BoundedBuffer::with_items(4, (0..3).map(|i| json!(i)));

        assert!(buffer.read_exact(4).is_none());
        assert_eq!(buffer.size(), 3);
        assert_eq!(buffer.read_exact(2).unwrap(), vec![json!(0), json!(1)]);
        assert_eq!(buffer.read(), Some(json!(2)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_with_items_grows_capacity() {
        let buffer = BoundedBuffer::with_items(2, (0..5).map(|i| json!(i)));
        assert_eq!(buffer.capacity(), 5);
        assert_eq!(buffer.read_all().len(), 5);
    }
}
