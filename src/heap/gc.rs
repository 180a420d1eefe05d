// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tri-color mark-and-sweep over the arena in `heap::mod`.
//!
//! "Tri-color" here is realized without an explicit white/grey/black
//! field: a slot's `marked` bit is the black/white distinction, and the
//! grey set is the explicit work list in [`Heap::collect`]. An object is
//! white until `mark_object` flips its bit and pushes it to the work
//! list (grey); it becomes black once `trace_grey` pops it and marks its
//! children.

use super::{Heap, ObjData, ObjRef, UpvalueState};
use crate::value::Value;

/// Implemented by anything that owns live references into the heap and
/// must keep them alive across a collection: the VM (stack, frames, open
/// upvalues, globals) and the compiler (its chain of in-progress
/// functions). `Heap::collect` calls this once at the start of a cycle;
/// everything reachable from the marks it makes survives.
pub trait GcRoots {
    fn mark_roots(&self, heap: &mut Heap);
}

impl GcRoots for Vec<ObjRef> {
    fn mark_roots(&self, heap: &mut Heap) {
        for r in self {
            heap.mark_object(*r);
        }
    }
}

impl GcRoots for [ObjRef] {
    fn mark_roots(&self, heap: &mut Heap) {
        for r in self {
            heap.mark_object(*r);
        }
    }
}

/// No roots beyond whatever the heap itself is told about directly. Used
/// by tests and by natives that only ever hold already-rooted values.
pub struct NoRoots;

impl GcRoots for NoRoots {
    fn mark_roots(&self, _heap: &mut Heap) {}
}

impl Heap {
    /// Marks `r` black if it was white, and pushes it to the grey work
    /// list. Idempotent: marking an already-black object is a no-op,
    /// which is what makes cyclic graphs terminate.
    pub fn mark_object(&mut self, r: ObjRef) {
        if let Some(slot) = self.slots[r.0 as usize].as_mut() {
            if !slot.marked {
                slot.marked = true;
                self.grey.push(r);
            }
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Object(r) = value {
            self.mark_object(r);
        }
    }

    /// Runs one full collection cycle: mark from roots, trace until the
    /// grey set is empty, prune dead strings from the intern table, then
    /// sweep unmarked objects. Safe to call from inside [`Heap::allocate`]
    /// before the new object is linked in, since an object not yet on the
    /// arena can't be swept this cycle regardless of whether it's marked.
    pub fn collect(&mut self, roots: &dyn GcRoots) {
        let before = self.bytes_allocated;
        roots.mark_roots(self);
        self.trace_grey();
        self.prune_interned_strings();
        self.sweep();
        self.bytes_allocated = self.live_bytes();
        let previous_next_gc = self.next_gc;
        self.next_gc = self.bytes_allocated.saturating_mul(2).max(super::INITIAL_NEXT_GC);
        tracing::debug!(before, after = self.bytes_allocated, next_gc = self.next_gc, "gc cycle");
        if self.next_gc != previous_next_gc {
            tracing::warn!(
                previous = previous_next_gc,
                revised = self.next_gc,
                "gc threshold revised"
            );
        }
    }

    fn trace_grey(&mut self) {
        while let Some(r) = self.grey.pop() {
            let (objects, values) = self.children_of(r);
            for child in objects {
                self.mark_object(child);
            }
            for value in values {
                self.mark_value(value);
            }
        }
    }

    /// Enumerates the direct children of one object, per the variant
    /// table: strings and natives have none; everything else points at
    /// some mix of other objects and plain values.
    fn children_of(&self, r: ObjRef) -> (Vec<ObjRef>, Vec<Value>) {
        let mut objects = Vec::new();
        let mut values = Vec::new();
        match &self.slot(r).data {
            ObjData::String(_) | ObjData::Native(_) => {}
            ObjData::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    values.push(v);
                }
            }
            ObjData::Function(f) => {
                if let Some(name) = f.name {
                    objects.push(name);
                }
                values.extend(f.chunk.constants.iter().copied());
            }
            ObjData::Closure(c) => {
                objects.push(c.function);
                objects.extend(c.upvalues.iter().copied());
            }
            ObjData::Class(c) => {
                objects.push(c.name);
                for (key, value) in c.methods.iter() {
                    objects.push(key);
                    values.push(value);
                }
            }
            ObjData::Instance(i) => {
                objects.push(i.class);
                for (key, value) in i.fields.iter() {
                    objects.push(key);
                    values.push(value);
                }
            }
            ObjData::BoundMethod(b) => {
                values.push(b.receiver);
                objects.push(b.method);
            }
        }
        (objects, values)
    }

    /// The intern table holds weak references: any string not reached
    /// from a root (directly, or via a constant pool, field, etc.) is
    /// dropped from the table here, before sweep actually frees its slot.
    fn prune_interned_strings(&mut self) {
        let slots = &self.slots;
        self.strings
            .retain(|r| slots[r.0 as usize].as_ref().is_some_and(|s| s.marked));
    }

    fn sweep(&mut self) {
        for slot in &mut self.slots {
            match slot {
                Some(s) if s.marked => s.marked = false,
                Some(_) => *slot = None,
                None => {}
            }
        }
    }

    fn live_bytes(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|s| s.data.heap_size())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_string_is_collected_and_reachable_one_survives() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep", &NoRoots);
        let _drop_me = heap.intern("drop-me", &NoRoots);

        let roots = vec![keep];
        heap.collect(&roots);

        assert_eq!(heap.string_bytes(keep), "keep");
        // A fresh intern of the same bytes must not collide with a freed
        // slot silently resurrecting stale data.
        let keep_again = heap.intern("keep", &roots);
        assert_eq!(keep, keep_again);
    }

    #[test]
    fn cyclic_instance_and_class_do_not_hang_collection() {
        let mut heap = Heap::new();
        let name = heap.intern("Thing", &NoRoots);
        let class = heap.alloc_class(name, &NoRoots);
        let instance = heap.alloc_instance(class, &NoRoots);
        let roots = vec![instance];
        heap.collect(&roots);
        assert_eq!(heap.instance(instance).class, class);
    }
}
