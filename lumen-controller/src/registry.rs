//! Explicit name-to-handle table with a fixed capacity.
//!
//! Whoever creates a registry owns it and passes it where it is needed;
//! there is no process-wide lookup by name.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Named handles, bounded to `capacity` live entries.
#[derive(Debug)]
pub struct HandleRegistry<H> {
    capacity: usize,
    handles: BTreeMap<String, H>,
}

impl<H> HandleRegistry<H> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            handles: BTreeMap::new(),
        }
    }

    /// Add a handle under `name`.
    ///
    /// Fails with `AlreadyExists` if the name is taken, otherwise with
    /// `ResourceExhausted` if the registry is full.
    pub fn register(&mut self, name: impl Into<String>, handle: H) -> Result<()> {
        let name = name.into();
        if self.handles.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }
        if self.handles.len() >= self.capacity {
            return Err(Error::ResourceExhausted(self.capacity));
        }
        self.handles.insert(name, handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&H> {
        self.handles
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut H> {
        self.handles
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Remove and return a handle, freeing its slot.
    pub fn remove(&mut self, name: &str) -> Result<H> {
        self.handles
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut registry = HandleRegistry::with_capacity(2);
        registry.register("a", 1).unwrap();
        registry.register("b", 2).unwrap();

        assert_eq!(*registry.get("a").unwrap(), 1);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(matches!(registry.get("c"), Err(Error::NotFound(_))));
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut registry = HandleRegistry::with_capacity(2);
        registry.register("a", 1).unwrap();

        let err = registry.register("a", 9).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(ref n) if n == "a"));
        assert_eq!(*registry.get("a").unwrap(), 1);
    }

    #[test]
    fn full_registry_is_exhausted_until_a_slot_frees() {
        let mut registry = HandleRegistry::with_capacity(1);
        registry.register("a", ()).unwrap();

        let err = registry.register("b", ()).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(1)));

        registry.remove("a").unwrap();
        registry.register("b", ()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_missing_is_not_found() {
        let mut registry: HandleRegistry<u8> = HandleRegistry::with_capacity(1);
        assert!(matches!(registry.remove("x"), Err(Error::NotFound(_))));
    }
}
