// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Human-readable bytecode dump, enabled by the `trace` feature and the
//! CLI's `--trace` flag. Never built into a release binary without the
//! feature: the fetch-decode loop stays branch-free for everyone else.

use crate::bytecode::{Chunk, OpCode};
use crate::heap::Heap;

/// Disassembles every instruction in `chunk`, prefixed with `name`.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) {
    println!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, heap);
    }
}

/// Disassembles one instruction at `offset`, returning the offset of the
/// next one.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    print!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let op = OpCode::from_u8(chunk.code[offset]);
    match op {
        OpCode::Constant => constant_instruction("CONSTANT", chunk, offset, heap),
        OpCode::GetLocal => byte_instruction("GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("SET_LOCAL", chunk, offset),
        OpCode::GetGlobal => constant_instruction("GET_GLOBAL", chunk, offset, heap),
        OpCode::DefineGlobal => constant_instruction("DEFINE_GLOBAL", chunk, offset, heap),
        OpCode::SetGlobal => constant_instruction("SET_GLOBAL", chunk, offset, heap),
        OpCode::GetUpvalue => byte_instruction("GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("SET_UPVALUE", chunk, offset),
        OpCode::PopN => byte_instruction("POPN", chunk, offset),
        OpCode::Jump => jump_instruction("JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("CALL", chunk, offset),
        OpCode::Class => constant_instruction("CLASS", chunk, offset, heap),
        OpCode::Method => constant_instruction("METHOD", chunk, offset, heap),
        OpCode::GetField => constant_instruction("GET_FIELD", chunk, offset, heap),
        OpCode::SetField => constant_instruction("SET_FIELD", chunk, offset, heap),
        OpCode::Invoke => invoke_instruction("INVOKE", chunk, offset, heap),
        OpCode::Closure => closure_instruction(chunk, offset, heap),
        simple => simple_instruction(&format!("{simple:?}").to_uppercase(), offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name}");
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{name:<16} {slot:4}");
    offset + 2
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.code[offset + 1];
    let value = chunk.constants[idx as usize];
    println!("{name:<16} {idx:4} '{}'", heap.print_value(value));
    offset + 2
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.code[offset + 1];
    let argc = chunk.code[offset + 2];
    let value = chunk.constants[idx as usize];
    println!("{name:<16} ({argc} args) {idx:4} '{}'", heap.print_value(value));
    offset + 3
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    println!("{name:<16} {offset:4} -> {target}");
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.code[offset + 1];
    let value = chunk.constants[idx as usize];
    println!("CLOSURE          {idx:4} '{}'", heap.print_value(value));
    let upvalue_count = match value {
        crate::value::Value::Object(r) => heap.function(r).upvalue_count,
        _ => 0,
    };
    let mut next = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[next];
        let index = chunk.code[next + 1];
        println!(
            "{next:04}      |                     {} {index}",
            if is_local != 0 { "local" } else { "upvalue" }
        );
        next += 2;
    }
    next
}
