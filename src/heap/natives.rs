// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The built-in global functions every script starts with: `clock`,
//! `slen`, `sqrt`, `str`, `gc`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RuntimeError;
use crate::heap::{GcRoots, Heap};
use crate::value::Value;

/// Every native a fresh VM registers into its globals table, as
/// `(name, arity, function)`. `gc`'s listed function is never actually
/// invoked — the VM intercepts calls to it by name so it can pass its own
/// stack/frame roots to `Heap::collect`, which a plain `NativeFn` has no
/// way to reach — see `vm::VM::call_native`.
pub const BUILTINS: &[(&str, Option<u8>, crate::heap::NativeFn)] = &[
    ("clock", Some(0), clock),
    ("slen", Some(1), slen),
    ("sqrt", Some(1), sqrt),
    ("str", Some(1), str_of),
    ("gc", Some(0), gc_stub),
];

fn expect_number(value: Value) -> Result<f64, RuntimeError> {
    value.as_number().ok_or(RuntimeError::TypeError { expected: "number" })
}

fn clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Value::Number(elapsed.as_secs_f64()))
}

fn slen(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let r = args[0]
        .as_object()
        .filter(|r| heap.kind_name(*r) == "string")
        .ok_or(RuntimeError::TypeError { expected: "string" })?;
    Ok(Value::Number(heap.string_bytes(r).len() as f64))
}

fn sqrt(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    let n = expect_number(args[0])?;
    Ok(Value::Number(n.sqrt()))
}

fn str_of(heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
    if args[0].as_object().is_some() {
        return Err(RuntimeError::TypeError {
            expected: "null, bool, or number",
        });
    }
    let rendered = heap.print_value(args[0]);
    let interned = heap.intern(&rendered, &crate::heap::gc::NoRoots);
    Ok(Value::Object(interned))
}

fn gc_stub(_heap: &mut Heap, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Null)
}

/// Installs every builtin into `roots`-visible globals via the caller's
/// own `define` closure, so the caller (the VM) controls how names get
/// interned and installed without this module depending on `vm::VM`.
pub fn for_each(mut define: impl FnMut(&'static str, Option<u8>, crate::heap::NativeFn)) {
    for &(name, arity, func) in BUILTINS {
        define(name, arity, func);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slen_counts_bytes() {
        let mut heap = Heap::new();
        let s = heap.intern("hello", &crate::heap::gc::NoRoots);
        assert_eq!(slen(&mut heap, &[Value::Object(s)]), Ok(Value::Number(5.0)));
    }

    #[test]
    fn sqrt_of_four_is_two() {
        let mut heap = Heap::new();
        assert_eq!(sqrt(&mut heap, &[Value::Number(4.0)]), Ok(Value::Number(2.0)));
    }
}
