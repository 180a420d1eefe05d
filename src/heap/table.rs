// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Open-addressing hash table with linear probing, used both for globals
//! and object fields/methods, and (via [`Table::find_string`]) as the
//! string-intern pool's lookup half.

use crate::heap::{Heap, ObjRef};
use crate::value::Value;

const MIN_CAPACITY: usize = 8;
const LOAD_FACTOR: f64 = 0.75;

#[derive(Clone)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

/// An empty slot is `(key = None, value = Null)`; a tombstone left behind
/// by removal is `(key = None, value = Bool(true))`. Keeping the Value-
/// level encoding (rather than a separate enum) matches the layout the
/// table is specified against and keeps entries a single `Value`-sized
/// tag wide.
impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            hash: 0,
            value: Value::Null,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }

    fn is_empty(&self) -> bool {
        self.key.is_none() && !self.is_tombstone()
    }
}

/// A string-keyed hash map. Keys are compared by `ObjRef` identity, which
/// is sound because every key is an interned string.
#[derive(Default)]
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.probe(key, hash)?;
        self.entries[idx].key.map(|_| self.entries[idx].value)
    }

    /// Returns `true` if this inserted a brand-new key.
    pub fn insert(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.needs_growth() {
            self.grow();
        }
        let idx = self
            .probe(key, hash)
            .unwrap_or_else(|| unreachable!("table probe failed after growth check"));
        let is_new = self.entries[idx].key.is_none();
        if is_new {
            self.count += 1;
        }
        self.entries[idx] = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Replaces the entry with a tombstone; returns `true` if a key was
    /// present to remove.
    pub fn remove(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let Some(idx) = self.probe(key, hash) else {
            return false;
        };
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry {
            key: None,
            hash,
            value: Value::Bool(true),
        };
        self.count -= 1;
        true
    }

    /// Finds an interned string with the given bytes, comparing content
    /// rather than `ObjRef` identity — this is how the intern pool
    /// resolves "do we already have this string" before allocating a new
    /// one.
    #[must_use]
    pub fn find_string(&self, heap: &Heap, bytes: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            if entry.is_empty() {
                return None;
            }
            if let Some(key) = entry.key {
                if entry.hash == hash && heap.string_bytes(key) == bytes {
                    return Some(key);
                }
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Tombstones every entry whose key fails `keep`. Used by the
    /// string-intern "remove white" pass at GC time.
    pub fn retain(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !keep(key) {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                    self.count -= 1;
                }
            }
        }
    }

    fn needs_growth(&self) -> bool {
        self.entries.is_empty()
            || (self.count + 1) as f64 > self.entries.len() as f64 * LOAD_FACTOR
    }

    fn grow(&mut self) {
        let new_capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
        let old_entries = std::mem::replace(
            &mut self.entries,
            (0..new_capacity).map(|_| Entry::empty()).collect(),
        );
        self.count = 0;
        for entry in old_entries {
            if let Some(key) = entry.key {
                let idx = self
                    .probe(key, entry.hash)
                    .expect("freshly-grown table always has room");
                self.entries[idx] = Entry {
                    key: Some(key),
                    hash: entry.hash,
                    value: entry.value,
                };
                self.count += 1;
            }
        }
    }

    /// Linear probe for `key`: stops at the first truly-empty slot (not a
    /// tombstone) that doesn't hold `key`, returning the first tombstone
    /// seen along the way if `key` isn't found, per the insertion rule
    /// ("prefer a tombstone encountered earlier in the probe chain").
    fn probe(&self, key: ObjRef, hash: u32) -> Option<usize> {
        let capacity = self.entries.len();
        if capacity == 0 {
            return None;
        }
        let mut index = (hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            if entry.key == Some(key) {
                return Some(index);
            }
            if entry.is_tombstone() {
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.is_empty() {
                return Some(tombstone.unwrap_or(index));
            }
            index = (index + 1) % capacity;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn insert_get_remove_round_trip() {
        let mut heap = Heap::new();
        let roots: Vec<ObjRef> = Vec::new();
        let a = heap.intern("a", &roots);
        let b = heap.intern("b", &roots);
        let mut table = Table::new();
        assert!(table.insert(a, heap.string_hash(a), Value::Number(1.0)));
        assert!(table.insert(b, heap.string_hash(b), Value::Number(2.0)));
        assert_eq!(table.get(a, heap.string_hash(a)), Some(Value::Number(1.0)));
        assert!(table.remove(a, heap.string_hash(a)));
        assert_eq!(table.get(a, heap.string_hash(a)), None);
        assert_eq!(table.get(b, heap.string_hash(b)), Some(Value::Number(2.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let roots: Vec<ObjRef> = Vec::new();
        let mut table = Table::new();
        for i in 0..64 {
            let s = heap.intern(&i.to_string(), &roots);
            table.insert(s, heap.string_hash(s), Value::Number(i as f64));
        }
        assert_eq!(table.len(), 64);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::heap::Heap;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Insert(u8),
        Remove(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Insert),
            (0u8..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// After any interleaving of insert/remove, the table's surviving
        /// key set matches a plain `HashSet` model, and the load factor
        /// never exceeds 0.75 following a resize.
        #[test]
        fn matches_hash_set_model(ops in prop::collection::vec(op_strategy(), 0..200)) {
            let mut heap = Heap::new();
            let roots: Vec<ObjRef> = Vec::new();
            let mut table = Table::new();
            let mut model: HashSet<u8> = HashSet::new();

            for op in ops {
                match op {
                    Op::Insert(k) => {
                        let name = format!("k{k}");
                        let r = heap.intern(&name, &roots);
                        table.insert(r, heap.string_hash(r), Value::Number(k as f64));
                        model.insert(k);
                    }
                    Op::Remove(k) => {
                        let name = format!("k{k}");
                        let r = heap.intern(&name, &roots);
                        table.remove(r, heap.string_hash(r));
                        model.remove(&k);
                    }
                }
            }

            for k in 0u8..16 {
                let name = format!("k{k}");
                let r = heap.intern(&name, &roots);
                let present = table.get(r, heap.string_hash(r)).is_some();
                prop_assert_eq!(present, model.contains(&k));
            }
            prop_assert_eq!(table.len(), model.len());
        }
    }
}
