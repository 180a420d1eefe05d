// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The stack-based bytecode interpreter: fetch, decode, execute.

use std::io::Write;

use crate::bytecode::OpCode;
use crate::error::{InterpretError, RuntimeError, TraceFrame};
use crate::heap::natives;
use crate::heap::table::Table;
use crate::heap::{Heap, ObjKind, ObjRef, UpvalueState};
use crate::value::Value;

const STACK_MAX: usize = 16 * 1024;
const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

pub struct VM {
    /// Exposed so embedders can drive `compiler::compile` directly rather
    /// than only through the top-level [`crate::run`] convenience
    /// function.
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    trace_enabled: bool,
    output: Box<dyn Write>,
}

impl VM {
    #[must_use]
    pub fn new(stress_gc: bool, trace_enabled: bool) -> Self {
        Self::with_output(stress_gc, trace_enabled, Box::new(std::io::stdout()))
    }

    /// As [`VM::new`], but `print` writes to `output` instead of stdout —
    /// what the test suite uses to assert on a script's output without
    /// capturing the real process stream.
    #[must_use]
    pub fn with_output(stress_gc: bool, trace_enabled: bool, output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        heap.stress_gc = stress_gc;
        let mut globals = Table::new();
        natives::for_each(|name, arity, func| {
            let name_ref = heap.intern(name, &crate::heap::gc::NoRoots);
            let hash = heap.string_hash(name_ref);
            let native_ref = heap.alloc_native(name, arity, func, &crate::heap::gc::NoRoots);
            globals.insert(name_ref, hash, Value::Object(native_ref));
        });
        VM {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            open_upvalues: Vec::new(),
            trace_enabled,
            output,
        }
    }

    /// Every object reachable from the VM's own state: the value stack,
    /// every active frame's closure, every still-open upvalue, and the
    /// globals table. Snapshotted to a plain `Vec` (rather than passing
    /// `&self`/`&dyn GcRoots` through to `Heap`) because the VM owns the
    /// `Heap` it would need to borrow mutably at the same time.
    fn root_snapshot(&self) -> Vec<ObjRef> {
        let mut roots = Vec::new();
        for v in &self.stack {
            if let Value::Object(r) = v {
                roots.push(*r);
            }
        }
        for f in &self.frames {
            roots.push(f.closure);
        }
        roots.extend(self.open_upvalues.iter().copied());
        for (k, v) in self.globals.iter() {
            roots.push(k);
            if let Value::Object(r) = v {
                roots.push(r);
            }
        }
        roots
    }

    /// Wraps the compiled script function in a closure, runs it to
    /// completion, and translates any fault into an [`InterpretError`]
    /// carrying the stack trace active at the point of failure.
    pub fn run(&mut self, script: ObjRef) -> Result<(), InterpretError> {
        let roots = self.root_snapshot();
        let closure = self.heap.alloc_closure(script, Vec::new(), &roots);
        self.stack.push(Value::Object(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
        });
        self.execute().map_err(|error| {
            let trace = self.build_trace();
            InterpretError::Runtime { error, trace }
        })
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| {
                let function = self.heap.closure(f.closure).function;
                let chunk = &self.heap.function(function).chunk;
                let line = chunk.lines.get(f.ip.saturating_sub(1)).copied().unwrap_or(0);
                let name = match self.heap.function(function).name {
                    Some(n) => self.heap.string_bytes(n).to_string(),
                    None => "<script>".to_string(),
                };
                TraceFrame { line, name }
            })
            .collect()
    }

    // ---- fetch/decode helpers ---------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("at least one active frame");
        let function = self.heap.closure(frame.closure).function;
        let byte = self.heap.function(function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&self, idx: u8) -> Value {
        let frame = self.frames.last().expect("at least one active frame");
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[idx as usize]
    }

    fn read_constant_object(&self, idx: u8) -> ObjRef {
        self.read_constant(idx)
            .as_object()
            .expect("compiler only emits object constants for name operands")
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler bug")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- upvalues -----------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        for &r in &self.open_upvalues {
            if let UpvalueState::Open(idx) = self.heap.upvalue(r).state {
                if idx == stack_index {
                    return r;
                }
            }
        }
        let roots = self.root_snapshot();
        let upvalue = self.heap.alloc_upvalue(UpvalueState::Open(stack_index), &roots);
        let pos = self
            .open_upvalues
            .iter()
            .position(|&r| matches!(self.heap.upvalue(r).state, UpvalueState::Open(idx) if idx < stack_index))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, upvalue);
        upvalue
    }

    fn close_upvalues(&mut self, from_index: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            if let UpvalueState::Open(idx) = self.heap.upvalue(r).state {
                if idx >= from_index {
                    let value = self.stack[idx];
                    self.heap.upvalue_mut(r).state = UpvalueState::Closed(value);
                    self.open_upvalues.remove(i);
                    continue;
                }
            }
            i += 1;
        }
    }

    // ---- calls ----------------------------------------------------------

    fn call_value(&mut self, callee_slot: usize, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Some(r) = callee.as_object() else {
            return Err(RuntimeError::NotCallable);
        };
        self.dispatch_function_like(callee_slot, r, argc)
    }

    /// Dispatches closures, natives, classes, and bound methods. A bound
    /// method rebinds the receiver into `callee_slot` and recurses on its
    /// underlying closure, so this is the single entry point `Call`,
    /// `Invoke`, and class instantiation all share.
    fn dispatch_function_like(&mut self, callee_slot: usize, r: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        match self.heap.kind(r) {
            ObjKind::Closure => {
                let function = self.heap.closure(r).function;
                let arity = self.heap.function(function).arity;
                if arity != argc {
                    return Err(RuntimeError::ArityMismatch { expected: arity, got: argc });
                }
                if self.frames.len() >= FRAMES_MAX {
                    return Err(RuntimeError::StackOverflow);
                }
                self.frames.push(CallFrame {
                    closure: r,
                    ip: 0,
                    base: callee_slot,
                });
                Ok(())
            }
            ObjKind::BoundMethod => {
                let bound = self.heap.bound_method(r);
                let receiver = bound.receiver;
                let method = bound.method;
                self.stack[callee_slot] = receiver;
                self.dispatch_function_like(callee_slot, method, argc)
            }
            ObjKind::Native => self.call_native(callee_slot, r, argc),
            ObjKind::Class => self.call_class(callee_slot, r, argc),
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_native(&mut self, callee_slot: usize, r: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let native = self.heap.native(r);
        if let Some(expected) = native.arity {
            if expected != argc {
                return Err(RuntimeError::ArityMismatch { expected, got: argc });
            }
        }
        let result = if native.name == "gc" {
            let roots = self.root_snapshot();
            self.heap.collect(&roots);
            Value::Null
        } else {
            let args: Vec<Value> = self.stack[callee_slot + 1..].to_vec();
            (native.func)(&mut self.heap, &args)?
        };
        self.stack.truncate(callee_slot);
        self.push(result)
    }

    fn call_class(&mut self, callee_slot: usize, class_ref: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let roots = self.root_snapshot();
        let instance = self.heap.alloc_instance(class_ref, &roots);
        self.stack[callee_slot] = Value::Object(instance);
        let name = self.heap.class(class_ref).name;
        let hash = self.heap.string_hash(name);
        match self.heap.class(class_ref).methods.get(name, hash) {
            Some(init) => {
                let init_ref = init.as_object().expect("methods table holds closures");
                self.dispatch_function_like(callee_slot, init_ref, argc)
            }
            None => {
                if argc != 0 {
                    return Err(RuntimeError::ArityMismatch { expected: 0, got: argc });
                }
                self.stack.truncate(callee_slot + 1);
                Ok(())
            }
        }
    }

    // ---- arithmetic -----------------------------------------------------

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let (a, b) = (
            a.as_number().ok_or(RuntimeError::TypeError { expected: "number" })?,
            b.as_number().ok_or(RuntimeError::TypeError { expected: "number" })?,
        );
        self.push(op(a, b))
    }

    fn nonneg_int(v: Value) -> Option<u64> {
        let n = v.as_number()?;
        if n.is_finite() && n >= 0.0 && n.fract() == 0.0 {
            Some(n as u64)
        } else {
            None
        }
    }

    // ---- the loop ---------------------------------------------------

    fn execute(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace")]
            if self.trace_enabled {
                let frame = self.frames.last().unwrap();
                let function = self.heap.closure(frame.closure).function;
                crate::compiler::disassemble::disassemble_instruction(
                    &self.heap.function(function).chunk,
                    frame.ip,
                    &self.heap,
                );
            }
            #[cfg(not(feature = "trace"))]
            let _ = self.trace_enabled;

            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant => {
                    let idx = self.read_byte();
                    let v = self.read_constant(idx);
                    self.push(v)?;
                }
                OpCode::Null => self.push(Value::Null)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let n = self.read_byte();
                    self.stack.truncate(self.stack.len() - n as usize);
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte();
                    let base = self.frames.last().unwrap().base;
                    let v = self.stack[base + slot as usize];
                    self.push(v)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte();
                    let base = self.frames.last().unwrap().base;
                    let v = self.peek(0);
                    self.stack[base + slot as usize] = v;
                }
                OpCode::GetGlobal => {
                    let idx = self.read_byte();
                    let name_ref = self.read_constant_object(idx);
                    let hash = self.heap.string_hash(name_ref);
                    match self.globals.get(name_ref, hash) {
                        Some(v) => self.push(v)?,
                        None => {
                            return Err(RuntimeError::UndefinedVariable {
                                name: self.heap.string_bytes(name_ref).to_string(),
                            })
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_byte();
                    let name_ref = self.read_constant_object(idx);
                    let hash = self.heap.string_hash(name_ref);
                    let value = self.pop();
                    self.globals.insert(name_ref, hash, value);
                }
                OpCode::SetGlobal => {
                    let idx = self.read_byte();
                    let name_ref = self.read_constant_object(idx);
                    let hash = self.heap.string_hash(name_ref);
                    if self.globals.get(name_ref, hash).is_none() {
                        return Err(RuntimeError::UndefinedVariable {
                            name: self.heap.string_bytes(name_ref).to_string(),
                        });
                    }
                    let value = self.peek(0);
                    self.globals.insert(name_ref, hash, value);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte();
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_ref = self.heap.closure(closure).upvalues[slot as usize];
                    let value = match self.heap.upvalue(upvalue_ref).state {
                        UpvalueState::Open(idx) => self.stack[idx],
                        UpvalueState::Closed(v) => v,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte();
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue_ref = self.heap.closure(closure).upvalues[slot as usize];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue_ref).state {
                        UpvalueState::Open(idx) => self.stack[idx] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue_ref).state = UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Equals => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::NotEquals => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b))?;
                }
                OpCode::Less => self.numeric_binary(|a, b| Value::Bool(a < b))?,
                OpCode::LessEqual => self.numeric_binary(|a, b| Value::Bool(a <= b))?,
                OpCode::Greater => self.numeric_binary(|a, b| Value::Bool(a > b))?,
                OpCode::GreaterEqual => self.numeric_binary(|a, b| Value::Bool(a >= b))?,
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y))?,
                        (Value::Object(ra), Value::Object(rb))
                            if self.heap.kind_name(ra) == "string" && self.heap.kind_name(rb) == "string" =>
                        {
                            let mut joined = String::with_capacity(
                                self.heap.string_bytes(ra).len() + self.heap.string_bytes(rb).len(),
                            );
                            joined.push_str(self.heap.string_bytes(ra));
                            joined.push_str(self.heap.string_bytes(rb));
                            let roots = self.root_snapshot();
                            let interned = self.heap.intern(&joined, &roots);
                            self.push(Value::Object(interned))?;
                        }
                        _ => return Err(RuntimeError::TypeError { expected: "number or string" }),
                    }
                }
                OpCode::Sub => self.numeric_binary(|a, b| Value::Number(a - b))?,
                OpCode::Mul => self.numeric_binary(|a, b| Value::Number(a * b))?,
                OpCode::Div => self.numeric_binary(|a, b| Value::Number(a / b))?,
                OpCode::Modulo => {
                    let b = self.pop();
                    let a = self.pop();
                    match (Self::nonneg_int(a), Self::nonneg_int(b)) {
                        (Some(x), Some(y)) if y != 0 => self.push(Value::Number((x % y) as f64))?,
                        _ => return Err(RuntimeError::TypeError { expected: "non-negative integer" }),
                    }
                }
                OpCode::Negate => {
                    let v = self.pop();
                    let n = v.as_number().ok_or(RuntimeError::TypeError { expected: "number" })?;
                    self.push(Value::Number(-n))?;
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()))?;
                }
                OpCode::Factorial => {
                    let v = self.pop();
                    let n = Self::nonneg_int(v).ok_or(RuntimeError::TypeError { expected: "non-negative integer" })?;
                    let mut product = 1.0f64;
                    for i in 1..=n {
                        product *= i as f64;
                    }
                    self.push(Value::Number(product))?;
                }
                OpCode::Print => {
                    let v = self.pop();
                    let rendered = self.heap.print_value(v);
                    let _ = writeln!(self.output, "{rendered}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee_slot = self.stack.len() - 1 - argc as usize;
                    let callee = self.stack[callee_slot];
                    self.call_value(callee_slot, callee, argc)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no active frame");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
                OpCode::Closure => {
                    let const_idx = self.read_byte();
                    let function_ref = self.read_constant_object(const_idx);
                    let upvalue_count = self.heap.function(function_ref).upvalue_count;
                    let (base, enclosing) = {
                        let frame = self.frames.last().unwrap();
                        (frame.base, frame.closure)
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte();
                        let index = self.read_byte();
                        if is_local != 0 {
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            upvalues.push(self.heap.closure(enclosing).upvalues[index as usize]);
                        }
                    }
                    let roots = self.root_snapshot();
                    let closure_ref = self.heap.alloc_closure(function_ref, upvalues, &roots);
                    self.push(Value::Object(closure_ref))?;
                }
                OpCode::Class => {
                    let idx = self.read_byte();
                    let name_ref = self.read_constant_object(idx);
                    let roots = self.root_snapshot();
                    let class_ref = self.heap.alloc_class(name_ref, &roots);
                    self.push(Value::Object(class_ref))?;
                }
                OpCode::Method => {
                    let idx = self.read_byte();
                    let name_ref = self.read_constant_object(idx);
                    let hash = self.heap.string_hash(name_ref);
                    let method = self.pop();
                    let class_ref = self.peek(0).as_object().expect("class sits below its methods");
                    self.heap.class_mut(class_ref).methods.insert(name_ref, hash, method);
                }
                OpCode::GetField => {
                    let idx = self.read_byte();
                    let name_ref = self.read_constant_object(idx);
                    let instance_val = self.pop();
                    let instance_ref = instance_val
                        .as_object()
                        .filter(|r| self.heap.kind_name(*r) == "instance")
                        .ok_or(RuntimeError::TypeError { expected: "instance" })?;
                    let hash = self.heap.string_hash(name_ref);
                    if let Some(v) = self.heap.instance(instance_ref).fields.get(name_ref, hash) {
                        self.push(v)?;
                    } else {
                        let class_ref = self.heap.instance(instance_ref).class;
                        match self.heap.class(class_ref).methods.get(name_ref, hash) {
                            Some(method) => {
                                let method_ref = method.as_object().expect("methods table holds closures");
                                let roots = self.root_snapshot();
                                let bound = self.heap.alloc_bound_method(instance_val, method_ref, &roots);
                                self.push(Value::Object(bound))?;
                            }
                            None => {
                                return Err(RuntimeError::UndefinedField {
                                    name: self.heap.string_bytes(name_ref).to_string(),
                                })
                            }
                        }
                    }
                }
                OpCode::SetField => {
                    let idx = self.read_byte();
                    let name_ref = self.read_constant_object(idx);
                    let value = self.pop();
                    let instance_val = self.pop();
                    let instance_ref = instance_val
                        .as_object()
                        .filter(|r| self.heap.kind_name(*r) == "instance")
                        .ok_or(RuntimeError::TypeError { expected: "instance" })?;
                    let hash = self.heap.string_hash(name_ref);
                    self.heap.instance_mut(instance_ref).fields.insert(name_ref, hash, value);
                    self.push(value)?;
                }
                OpCode::Invoke => {
                    let idx = self.read_byte();
                    let name_ref = self.read_constant_object(idx);
                    let argc = self.read_byte();
                    let receiver_slot = self.stack.len() - 1 - argc as usize;
                    let receiver = self.stack[receiver_slot];
                    let instance_ref = receiver
                        .as_object()
                        .filter(|r| self.heap.kind_name(*r) == "instance")
                        .ok_or(RuntimeError::TypeError { expected: "instance" })?;
                    let hash = self.heap.string_hash(name_ref);
                    if let Some(field_val) = self.heap.instance(instance_ref).fields.get(name_ref, hash) {
                        self.stack[receiver_slot] = field_val;
                        self.call_value(receiver_slot, field_val, argc)?;
                    } else {
                        let class_ref = self.heap.instance(instance_ref).class;
                        let method = self.heap.class(class_ref).methods.get(name_ref, hash).ok_or_else(|| {
                            RuntimeError::UndefinedField {
                                name: self.heap.string_bytes(name_ref).to_string(),
                            }
                        })?;
                        self.call_value(receiver_slot, method, argc)?;
                    }
                }
                OpCode::Index => {
                    let index_val = self.pop();
                    let target_val = self.pop();
                    let target_ref = target_val
                        .as_object()
                        .filter(|r| self.heap.kind_name(*r) == "string")
                        .ok_or(RuntimeError::TypeError { expected: "string" })?;
                    let bytes = self.heap.string_bytes(target_ref).as_bytes();
                    let i = Self::nonneg_int(index_val).ok_or(RuntimeError::InvalidIndex)?;
                    let byte = *bytes.get(i as usize).ok_or(RuntimeError::InvalidIndex)?;
                    let roots = self.root_snapshot();
                    let ch = (byte as char).to_string();
                    let interned = self.heap.intern(&ch, &roots);
                    self.push(Value::Object(interned))?;
                }
            }
        }
    }
}
