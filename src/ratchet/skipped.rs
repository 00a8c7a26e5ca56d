use crate::types::SymmetricKey;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// (sender ratchet public key, message number)
pub(crate) type SkippedKeyId = ([u8; 32], u32);

/// Bounded cache of message keys derived ahead of time for out-of-order delivery.
///
/// Inserting beyond the capacity evicts the oldest entries first.
#[derive(Clone, Default)]
pub(crate) struct SkippedKeys {
    keys: HashMap<SkippedKeyId, SymmetricKey>,
    order: VecDeque<SkippedKeyId>,
    capacity: usize,
}

impl SkippedKeys {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn get(&self, id: &SkippedKeyId) -> Option<&SymmetricKey> {
        self.keys.get(id)
    }

    /// Removes a key once it decrypted its message.
    pub(crate) fn remove(&mut self, id: &SkippedKeyId) {
        if self.keys.remove(id).is_some() {
            self.order.retain(|entry| entry != id);
        }
    }

    pub(crate) fn insert(&mut self, id: SkippedKeyId, key: SymmetricKey) {
        if self.keys.insert(id, key).is_none() {
            self.order.push_back(id);
        }

        let mut evicted = 0usize;
        while self.keys.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
            evicted += 1;
        }
        if evicted > 0 {
            warn!(evicted, capacity = self.capacity, "evicted skipped message keys");
        }
    }

    /// Entries oldest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&SkippedKeyId, &SymmetricKey)> {
        self.order
            .iter()
            .filter_map(|id| self.keys.get(id).map(|key| (id, key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn key(byte: u8) -> SymmetricKey {
        Zeroizing::new([byte; 32])
    }

    #[test]
    fn test_evicts_oldest_beyond_capacity() {
        let mut skipped = SkippedKeys::new(3);
        for n in 0..5u8 {
            skipped.insert(([1; 32], u32::from(n)), key(n));
        }

        assert_eq!(skipped.len(), 3);
        assert!(skipped.get(&([1; 32], 0)).is_none());
        assert!(skipped.get(&([1; 32], 1)).is_none());
        assert_eq!(**skipped.get(&([1; 32], 4)).unwrap(), [4; 32]);

        let order: Vec<u32> = skipped.iter().map(|((_, n), _)| *n).collect();
        assert_eq!(order, vec![2, 3, 4]);
    }

    #[test]
    fn test_removed_entries_do_not_count() {
        let mut skipped = SkippedKeys::new(2);
        skipped.insert(([1; 32], 0), key(0));
        skipped.insert(([1; 32], 1), key(1));
        skipped.remove(&([1; 32], 0));
        skipped.insert(([2; 32], 0), key(2));

        assert_eq!(skipped.len(), 2);
        assert!(skipped.get(&([1; 32], 1)).is_some());
        assert!(skipped.get(&([2; 32], 0)).is_some());
    }
}
