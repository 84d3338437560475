//! Keyed store that never creates entries implicitly.
//!
//! Shared entities such as networks are referenced by many interfaces. A
//! lookup that silently inserted a default entry would leave a network with a
//! bogus reference count, so `SyncMap` only creates entries through methods
//! that say so: [`SyncMap::acquire_ref`].

use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;

/// Error type for reference-count operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncMapError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Reference count underflow")]
    RefCountUnderflow,
}

/// Values that count how many holders reference them.
pub trait HasRefCount {
    /// Increments the reference count and returns the new value.
    fn increment_ref(&mut self) -> u32;

    /// Decrements the reference count and returns the new value, or `None`
    /// if it is already zero.
    fn decrement_ref(&mut self) -> Option<u32>;
}

/// Map wrapper with explicit-creation semantics.
#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    /// Returns the value for `key`. Never creates an entry.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
    V: HasRefCount,
{
    /// Takes a reference on `key`, creating the entry with `create` first if
    /// it is absent. Returns the new reference count.
    pub fn acquire_ref<F>(&mut self, key: K, create: F) -> u32
    where
        F: FnOnce() -> V,
    {
        self.inner.entry(key).or_insert_with(create).increment_ref()
    }

    /// Drops one reference and removes the entry once nothing references it.
    ///
    /// Returns the removed value when the count reached zero.
    pub fn release_ref(&mut self, key: &K) -> Result<Option<V>, SyncMapError> {
        let entry = self.inner.get_mut(key).ok_or(SyncMapError::KeyNotFound)?;
        match entry.decrement_ref() {
            Some(0) => Ok(self.inner.remove(key)),
            Some(_) => Ok(None),
            None => Err(SyncMapError::RefCountUnderflow),
        }
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
