// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Concurrent tag store shared between the wire side and the bus side.
//!
//! A tag is a string name for a scalar value. Protocol handlers read tags
//! while answering wire requests; bus handlers overwrite them from incoming
//! Status envelopes. Reads see the last committed value, writes are atomic
//! per tag, and no cross-tag atomicity is offered.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Multiple-reader / single-writer map of tag name to value.
///
/// Cloning is cheap and shares the underlying map.
#[derive(Clone, Default)]
pub struct TagStore {
    inner: Arc<RwLock<HashMap<String, f64>>>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register tags so later `snapshot` calls include them even before
    /// the first status arrives.
    pub fn seed<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = self.inner.write();
        for tag in tags {
            map.entry(tag.into()).or_insert(0.0);
        }
    }

    /// Last committed value for `tag`, if known.
    pub fn read(&self, tag: &str) -> Option<f64> {
        self.inner.read().get(tag).copied()
    }

    /// Like [`TagStore::read`] but defaulting to 0.0 for unknown tags.
    pub fn read_or_zero(&self, tag: &str) -> f64 {
        self.read(tag).unwrap_or(0.0)
    }

    pub fn write(&self, tag: &str, value: f64) {
        self.inner.write().insert(tag.to_string(), value);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.inner.read().contains_key(tag)
    }

    /// Copy of the full map.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_returns_last_write() {
        let store = TagStore::new();
        store.write("bus-692.voltage", 120.5);
        store.write("bus-692.voltage", 121.0);
        assert_eq!(store.read("bus-692.voltage"), Some(121.0));
    }

    #[test]
    fn seed_does_not_clobber_existing_values() {
        let store = TagStore::new();
        store.write("sw.breaker", 1.0);
        store.seed(["sw.breaker", "load"]);
        assert_eq!(store.read("sw.breaker"), Some(1.0));
        assert_eq!(store.read("load"), Some(0.0));
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let store = TagStore::new();
        store.write("x", 0.0);

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    store.write("x", i as f64);
                }
            })
        };

        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let v = store.read_or_zero("x");
                    assert!((0.0..1000.0).contains(&v));
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(store.read("x"), Some(999.0));
    }
}
