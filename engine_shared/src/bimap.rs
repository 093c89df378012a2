//! Bijective registry.
//!
//! A concurrent two-way map: every key maps to exactly one value and every
//! value maps back to exactly one key. The session layer uses it for the
//! endpoint <-> client ID registry and the packet name <-> tag table.
//!
//! Both directions sit behind a single reader-writer lock, so no reader can
//! observe a pair that is present on one side only. Reads take the lock with
//! `read_recursive`, which lets a caller already inside [`BijectiveMap::with_read`]
//! query the same map again without deadlocking.
//!
//! Lock order: this lock is a leaf. Nothing in this module calls out to user
//! code while holding it, so callers may hold their own locks around it.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use parking_lot::RwLock;
use thiserror::Error;

/// Bijective registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BimapError {
    /// Key and value share a type, which would make lookups by either side ambiguous.
    #[error("a bijective map cannot use the same type for keys and values")]
    SameKeyAndValueType,
    #[error("key or value already present")]
    DuplicateKeyOrValue,
    #[error("key not present")]
    MissingKey,
    #[error("value not present")]
    MissingValue,
}

struct Sides<K, V> {
    forward: HashMap<K, V>,
    reverse: HashMap<V, K>,
}

/// Thread-safe one-to-one map between `K` and `V`.
pub struct BijectiveMap<K, V> {
    sides: RwLock<Sides<K, V>>,
}

impl<K, V> BijectiveMap<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Eq + Hash + Clone + 'static,
{
    /// Creates an empty map.
    ///
    /// Fails with [`BimapError::SameKeyAndValueType`] when `K` and `V` are the
    /// same type. That is a programming error, not a runtime condition.
    pub fn new() -> Result<Self, BimapError> {
        if TypeId::of::<K>() == TypeId::of::<V>() {
            return Err(BimapError::SameKeyAndValueType);
        }
        Ok(Self {
            sides: RwLock::new(Sides {
                forward: HashMap::new(),
                reverse: HashMap::new(),
            }),
        })
    }

    /// Inserts a new pair. Neither side may already be present.
    pub fn add(&self, key: K, value: V) -> Result<(), BimapError> {
        let mut sides = self.sides.write();
        if sides.forward.contains_key(&key) || sides.reverse.contains_key(&value) {
            return Err(BimapError::DuplicateKeyOrValue);
        }
        sides.forward.insert(key.clone(), value.clone());
        sides.reverse.insert(value, key);
        Ok(())
    }

    /// Upserts `key -> value`, evicting whatever pair either side was bound to.
    pub fn set_forward(&self, key: K, value: V) {
        let mut sides = self.sides.write();
        if let Some(old_value) = sides.forward.remove(&key) {
            sides.reverse.remove(&old_value);
        }
        if let Some(old_key) = sides.reverse.remove(&value) {
            sides.forward.remove(&old_key);
        }
        sides.forward.insert(key.clone(), value.clone());
        sides.reverse.insert(value, key);
    }

    /// Upserts `value -> key`. Same eviction rules as [`Self::set_forward`].
    pub fn set_reverse(&self, value: V, key: K) {
        self.set_forward(key, value);
    }

    pub fn get_value(&self, key: &K) -> Result<V, BimapError> {
        self.try_get_value(key).ok_or(BimapError::MissingKey)
    }

    pub fn get_key(&self, value: &V) -> Result<K, BimapError> {
        self.try_get_key(value).ok_or(BimapError::MissingValue)
    }

    pub fn try_get_value(&self, key: &K) -> Option<V> {
        self.sides.read_recursive().forward.get(key).cloned()
    }

    pub fn try_get_key(&self, value: &V) -> Option<K> {
        self.sides.read_recursive().reverse.get(value).cloned()
    }

    /// Removes the pair owning `key`, returning its value.
    pub fn remove_key(&self, key: &K) -> Option<V> {
        let mut sides = self.sides.write();
        let value = sides.forward.remove(key)?;
        sides.reverse.remove(&value);
        Some(value)
    }

    /// Removes the pair owning `value`, returning its key.
    pub fn remove_value(&self, value: &V) -> Option<K> {
        let mut sides = self.sides.write();
        let key = sides.reverse.remove(value)?;
        sides.forward.remove(&key);
        Some(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.sides.read_recursive().forward.contains_key(key)
    }

    pub fn contains_value(&self, value: &V) -> bool {
        self.sides.read_recursive().reverse.contains_key(value)
    }

    /// True when `key` is bound to exactly `value`.
    pub fn contains_pair(&self, key: &K, value: &V) -> bool {
        self.sides
            .read_recursive()
            .forward
            .get(key)
            .is_some_and(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.sides.read_recursive().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut sides = self.sides.write();
        sides.forward.clear();
        sides.reverse.clear();
    }

    /// Copies out every pair. Order is unspecified.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.sides
            .read_recursive()
            .forward
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.sides.read_recursive().forward.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.sides.read_recursive().reverse.keys().cloned().collect()
    }

    /// Runs a multi-step read against the forward map under one shared lock.
    ///
    /// The closure may call other read methods on this map. Calling a write
    /// method from inside it deadlocks.
    pub fn with_read<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        let sides = self.sides.read_recursive();
        f(&sides.forward)
    }
}

impl<K, V> fmt::Debug for BijectiveMap<K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sides = self.sides.read_recursive();
        f.debug_map().entries(sides.forward.iter()).finish()
    }
}

impl<'a, K, V> IntoIterator for &'a BijectiveMap<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Eq + Hash + Clone + 'static,
{
    type Item = (K, V);
    type IntoIter = std::vec::IntoIter<(K, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshot().into_iter()
    }
}
