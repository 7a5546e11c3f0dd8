//! Lazily hashed state values.

use hashbrown::DefaultHashBuilder;
use std::hash::{BuildHasher, Hash};
use std::sync::OnceLock;

/// One seed per process, so equal values hash equally for as long as any
/// cache keyed on them lives.
static HASH_BUILDER: OnceLock<DefaultHashBuilder> = OnceLock::new();

/// 32-bit hash of any hashable value.
pub fn hash32<T: Hash + ?Sized>(value: &T) -> u32 {
    let hash = HASH_BUILDER
        .get_or_init(DefaultHashBuilder::default)
        .hash_one(value);
    (hash ^ (hash >> 32)) as u32
}

/// A value paired with a cached 32-bit hash.
///
/// Mutating the value only marks the hash dirty; it is recomputed the next
/// time [`Memoized::hash`] is called. Readers must not expect the cached hash
/// to follow writes eagerly.
#[derive(Debug, Clone)]
pub struct Memoized<T> {
    value: T,
    hash: u32,
    dirty: bool,
}

impl<T: Hash> Memoized<T> {
    /// Wrap a value. The hash is computed on first read.
    pub fn new(value: T) -> Self {
        Self {
            value,
            hash: 0,
            dirty: true,
        }
    }

    /// The wrapped value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mutable access; marks the hash dirty.
    pub fn get_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.value
    }

    /// Replace the value; marks the hash dirty.
    pub fn set(&mut self, value: T) {
        self.value = value;
        self.dirty = true;
    }

    /// Whether the next [`Memoized::hash`] call will recompute.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current hash, recomputed only if the value changed since the last read.
    pub fn hash(&mut self) -> u32 {
        if self.dirty {
            self.hash = hash32(&self.value);
            self.dirty = false;
        }
        self.hash
    }
}

impl<T: Hash + PartialEq> Memoized<T> {
    /// Replace the value only if it differs. Returns whether it changed.
    pub fn update(&mut self, value: T) -> bool {
        if self.value == value {
            false
        } else {
            self.set(value);
            true
        }
    }
}

impl<T: Hash + Default> Default for Memoized<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Composite key made of eight 32-bit hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompositeHash(pub [u32; 8]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_equal_values() {
        assert_eq!(hash32(&[1u32, 2, 3]), hash32(&vec![1u32, 2, 3][..]));
        assert_ne!(hash32(&1u32), hash32(&2u32));
    }

    #[test]
    fn hash_is_stable_across_threads() {
        let value = vec![7u32, 8, 9];
        let here = hash32(&value);
        let there = std::thread::spawn(move || hash32(&value)).join().unwrap();
        assert_eq!(here, there);
    }

    #[test]
    fn hash_is_lazy() {
        let mut memo = Memoized::new(5u32);
        assert!(memo.is_dirty());
        let first = memo.hash();
        assert!(!memo.is_dirty());

        *memo.get_mut() = 6;
        assert!(memo.is_dirty());
        let second = memo.hash();
        assert_ne!(first, second);

        memo.set(5);
        assert_eq!(memo.hash(), first);
    }

    #[test]
    fn update_ignores_equal_values() {
        let mut memo = Memoized::new(vec![1, 2]);
        memo.hash();
        assert!(!memo.update(vec![1, 2]));
        assert!(!memo.is_dirty());
        assert!(memo.update(vec![2, 1]));
        assert!(memo.is_dirty());
    }
}
