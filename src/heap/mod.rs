// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The heap: every object kind the runtime allocates, and the arena that
//! owns them.
//!
//! Objects are not reached through pointers. Each lives in a slot of a
//! single `Vec`, and a [`Value::Object`] carries the slot's index
//! ([`ObjRef`]) rather than a raw pointer into it. That keeps the mark-
//! sweep collector entirely in safe Rust: there is no pointer that can
//! dangle, so there is nothing for `unsafe` to protect. The arena plays
//! the role of the intrusive sweep list — sweeping walks it in index
//! order and clears the slots of anything left unmarked, which visits
//! every live object exactly once without a literal `next` field.

pub mod gc;
pub mod natives;
pub mod table;

use crate::bytecode::Chunk;
use crate::error::RuntimeError;
use crate::value::Value;
use table::Table;

pub use gc::GcRoots;

/// A non-owning handle to a heap object: the index of its slot. `Copy`
/// because handles are meant to be passed around freely the way a pointer
/// would be in the original design; there is no lifetime to track because
/// the arena, not the handle, owns the data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

struct ObjString {
    bytes: Box<str>,
    hash: u32,
}

pub struct ObjFunction {
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

/// A native function's signature. Natives get a `&mut Heap` (to intern
/// result strings, read argument strings, etc.) and the argument slice,
/// and return a `Result` rather than setting a side-channel error flag —
/// the book's `nativeError` flag exists only because C has no `Result`.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, RuntimeError>;

pub struct ObjNative {
    pub name: &'static str,
    pub arity: Option<u8>,
    pub func: NativeFn,
}

pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Clone, Copy)]
pub enum UpvalueState {
    /// Points at an absolute index in the VM's value stack. Indices
    /// survive stack reallocation, unlike the raw addresses a non-moving
    /// C stack can use directly.
    Open(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub state: UpvalueState,
}

pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

enum ObjData {
    String(ObjString),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// Unambiguous object tag for control-flow dispatch (call sites, GC
/// tracing). [`ObjData::kind_name`] collapses functions, closures, and
/// bound methods to the same display string; this does not.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjKind {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
}

impl ObjData {
    fn kind(&self) -> ObjKind {
        match self {
            ObjData::String(_) => ObjKind::String,
            ObjData::Function(_) => ObjKind::Function,
            ObjData::Native(_) => ObjKind::Native,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::BoundMethod(_) => ObjKind::BoundMethod,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            ObjData::String(_) => "string",
            ObjData::Function(_) => "function",
            ObjData::Native(_) => "native function",
            ObjData::Closure(_) => "function",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "function",
        }
    }

    /// A rough accounting size in bytes, used only to decide when to
    /// trigger a collection; it need not be exact, only monotonic in the
    /// object's actual footprint.
    fn heap_size(&self) -> usize {
        match self {
            ObjData::String(s) => 32 + s.bytes.len(),
            ObjData::Function(f) => 64 + f.chunk.code.len() + f.chunk.constants.len() * 16,
            ObjData::Native(_) => 32,
            ObjData::Closure(c) => 32 + c.upvalues.len() * 8,
            ObjData::Upvalue(_) => 24,
            ObjData::Class(c) => 32 + c.methods.len() * 24,
            ObjData::Instance(i) => 32 + i.fields.len() * 24,
            ObjData::BoundMethod(_) => 32,
        }
    }
}

struct Slot {
    marked: bool,
    data: ObjData,
}

/// Threshold for the first collection; chosen to let small scripts run to
/// completion without a GC cycle at all. Doubled after every subsequent
/// cycle, matching the "growth factor, a small constant >= 2" allowance.
const INITIAL_NEXT_GC: usize = 1 << 20;

/// Owns every heap object and the string-intern pool. There is
/// deliberately no `Drop`-based reclamation: objects are only ever freed
/// by [`Heap::collect`]'s sweep phase.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    strings: Table,
    grey: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    pub stress_gc: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            strings: Table::new(),
            grey: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: false,
        }
    }

    fn slot(&self, r: ObjRef) -> &Slot {
        self.slots[r.0 as usize]
            .as_ref()
            .expect("dangling ObjRef: object was swept while still referenced")
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut Slot {
        self.slots[r.0 as usize]
            .as_mut()
            .expect("dangling ObjRef: object was swept while still referenced")
    }

    fn allocate(&mut self, data: ObjData, roots: &dyn GcRoots) -> ObjRef {
        self.bytes_allocated += data.heap_size();
        if self.stress_gc || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }
        self.slots.push(Some(Slot {
            marked: false,
            data,
        }));
        ObjRef((self.slots.len() - 1) as u32)
    }

    /// Interns `s`, returning the existing object if an equal string is
    /// already known, or allocating a new one otherwise. All string
    /// literals and all runtime string results (concatenation, `str`,
    /// etc.) go through this so that reference equality coincides with
    /// content equality.
    pub fn intern(&mut self, s: &str, roots: &dyn GcRoots) -> ObjRef {
        let hash = fnv1a(s.as_bytes());
        if let Some(existing) = self.strings.find_string(self, s, hash) {
            return existing;
        }
        let obj_ref = self.allocate(
            ObjData::String(ObjString {
                bytes: s.into(),
                hash,
            }),
            roots,
        );
        self.strings.insert(obj_ref, hash, Value::Bool(true));
        obj_ref
    }

    pub fn alloc_function(
        &mut self,
        name: Option<ObjRef>,
        arity: u8,
        roots: &dyn GcRoots,
    ) -> ObjRef {
        self.allocate(
            ObjData::Function(ObjFunction {
                name,
                arity,
                upvalue_count: 0,
                chunk: Chunk::new(),
            }),
            roots,
        )
    }

    pub fn alloc_native(
        &mut self,
        name: &'static str,
        arity: Option<u8>,
        func: NativeFn,
        roots: &dyn GcRoots,
    ) -> ObjRef {
        self.allocate(ObjData::Native(ObjNative { name, arity, func }), roots)
    }

    pub fn alloc_closure(
        &mut self,
        function: ObjRef,
        upvalues: Vec<ObjRef>,
        roots: &dyn GcRoots,
    ) -> ObjRef {
        self.allocate(
            ObjData::Closure(ObjClosure { function, upvalues }),
            roots,
        )
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState, roots: &dyn GcRoots) -> ObjRef {
        self.allocate(ObjData::Upvalue(ObjUpvalue { state }), roots)
    }

    pub fn alloc_class(&mut self, name: ObjRef, roots: &dyn GcRoots) -> ObjRef {
        self.allocate(
            ObjData::Class(ObjClass {
                name,
                methods: Table::new(),
            }),
            roots,
        )
    }

    pub fn alloc_instance(&mut self, class: ObjRef, roots: &dyn GcRoots) -> ObjRef {
        self.allocate(
            ObjData::Instance(ObjInstance {
                class,
                fields: Table::new(),
            }),
            roots,
        )
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: ObjRef,
        roots: &dyn GcRoots,
    ) -> ObjRef {
        self.allocate(
            ObjData::BoundMethod(ObjBoundMethod { receiver, method }),
            roots,
        )
    }

    #[must_use]
    pub fn kind_name(&self, r: ObjRef) -> &'static str {
        self.slot(r).data.kind_name()
    }

    #[must_use]
    pub fn kind(&self, r: ObjRef) -> ObjKind {
        self.slot(r).data.kind()
    }

    #[must_use]
    pub fn string_bytes(&self, r: ObjRef) -> &str {
        match &self.slot(r).data {
            ObjData::String(s) => &s.bytes,
            _ => panic!("ObjRef {r:?} is not a string"),
        }
    }

    #[must_use]
    pub fn string_hash(&self, r: ObjRef) -> u32 {
        match &self.slot(r).data {
            ObjData::String(s) => s.hash,
            _ => panic!("ObjRef {r:?} is not a string"),
        }
    }

    #[must_use]
    pub fn function(&self, r: ObjRef) -> &ObjFunction {
        match &self.slot(r).data {
            ObjData::Function(f) => f,
            _ => panic!("ObjRef {r:?} is not a function"),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut ObjFunction {
        match &mut self.slot_mut(r).data {
            ObjData::Function(f) => f,
            _ => panic!("ObjRef {r:?} is not a function"),
        }
    }

    #[must_use]
    pub fn native(&self, r: ObjRef) -> &ObjNative {
        match &self.slot(r).data {
            ObjData::Native(n) => n,
            _ => panic!("ObjRef {r:?} is not a native"),
        }
    }

    #[must_use]
    pub fn closure(&self, r: ObjRef) -> &ObjClosure {
        match &self.slot(r).data {
            ObjData::Closure(c) => c,
            _ => panic!("ObjRef {r:?} is not a closure"),
        }
    }

    #[must_use]
    pub fn upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match &self.slot(r).data {
            ObjData::Upvalue(u) => u,
            _ => panic!("ObjRef {r:?} is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match &mut self.slot_mut(r).data {
            ObjData::Upvalue(u) => u,
            _ => panic!("ObjRef {r:?} is not an upvalue"),
        }
    }

    #[must_use]
    pub fn class(&self, r: ObjRef) -> &ObjClass {
        match &self.slot(r).data {
            ObjData::Class(c) => c,
            _ => panic!("ObjRef {r:?} is not a class"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match &mut self.slot_mut(r).data {
            ObjData::Class(c) => c,
            _ => panic!("ObjRef {r:?} is not a class"),
        }
    }

    #[must_use]
    pub fn instance(&self, r: ObjRef) -> &ObjInstance {
        match &self.slot(r).data {
            ObjData::Instance(i) => i,
            _ => panic!("ObjRef {r:?} is not an instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match &mut self.slot_mut(r).data {
            ObjData::Instance(i) => i,
            _ => panic!("ObjRef {r:?} is not an instance"),
        }
    }

    #[must_use]
    pub fn bound_method(&self, r: ObjRef) -> &ObjBoundMethod {
        match &self.slot(r).data {
            ObjData::BoundMethod(b) => b,
            _ => panic!("ObjRef {r:?} is not a bound method"),
        }
    }

    /// Renders a value the way `print` and `str` do. Needs the heap
    /// because strings, instances, and the rest live there, not inline in
    /// `Value`.
    #[must_use]
    pub fn print_value(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => crate::value::format_number(n),
            Value::Object(r) => match &self.slot(r).data {
                ObjData::String(s) => s.bytes.to_string(),
                ObjData::Function(f) => match f.name {
                    Some(n) => format!("<fn {}>", self.string_bytes(n)),
                    None => "<script>".to_string(),
                },
                ObjData::Native(n) => format!("<native fn {}>", n.name),
                ObjData::Closure(c) => self.print_value(Value::Object(c.function)),
                ObjData::Upvalue(_) => "<upvalue>".to_string(),
                ObjData::Class(c) => self.string_bytes(c.name).to_string(),
                ObjData::Instance(i) => {
                    format!("<{} instance>", self.string_bytes(self.class(i.class).name))
                }
                ObjData::BoundMethod(b) => self.print_value(Value::Object(b.method)),
            },
        }
    }
}

/// FNV-1a over raw bytes, the hash every interned string is keyed by.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_equal_content() {
        let mut heap = Heap::new();
        let roots: Vec<ObjRef> = Vec::new();
        let a = heap.intern("hello", &roots);
        let b = heap.intern("hello", &roots);
        assert_eq!(a, b);
        let c = heap.intern("world", &roots);
        assert_ne!(a, c);
    }

    #[test]
    fn fnv1a_is_stable() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), fnv1a(b"a"));
        assert_ne!(fnv1a(b"a"), fnv1a(b"b"));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Equal content always interns to the same `ObjRef`, regardless of
        /// how many unrelated strings were interned in between.
        #[test]
        fn equal_content_interns_to_one_object(
            strings in prop::collection::vec("[a-z]{0,8}", 1..20),
            repeat in "[a-z]{1,8}",
        ) {
            let mut heap = Heap::new();
            let roots: Vec<ObjRef> = Vec::new();
            for s in &strings {
                heap.intern(s, &roots);
            }
            let first = heap.intern(&repeat, &roots);
            for s in &strings {
                heap.intern(s, &roots);
            }
            let second = heap.intern(&repeat, &roots);
            prop_assert_eq!(first, second);
            prop_assert_eq!(heap.string_bytes(first), repeat.as_str());
        }
    }
}
