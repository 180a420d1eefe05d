// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Thistle: a single-pass bytecode compiler and stack-based virtual
//! machine for a small dynamically-typed, class-based scripting language.
//!
//! The pipeline has exactly two stages and no intermediate AST:
//! [`compiler::compile`] walks the token stream once, emitting bytecode
//! directly into a [`heap::ObjFunction`]'s chunk, and [`vm::VM`] executes
//! that chunk. Both stages share one [`heap::Heap`], the arena that owns
//! every string, function, class, and instance the program ever touches.

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod heap;
pub mod reader;
pub mod value;
pub mod vm;

pub use error::InterpretError;

/// Toggles available to any embedder of the library, not just the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Dump bytecode and trace every instruction as it executes. Has no
    /// effect unless the crate is built with the `trace` feature.
    pub trace: bool,
    /// Force a collection before every single heap allocation, to flush
    /// out GC-soundness bugs that only manifest under collection pressure.
    pub stress_gc: bool,
}

/// Compiles and runs `source` to completion.
///
/// # Errors
///
/// Returns [`InterpretError::Compile`] if `source` fails to compile, or
/// [`InterpretError::Runtime`] if it compiles but faults during execution.
pub fn run(source: &str, options: RunOptions) -> Result<(), InterpretError> {
    let mut machine = vm::VM::new(options.stress_gc, options.trace);
    let script = compiler::compile(source, &mut machine.heap).map_err(InterpretError::Compile)?;
    machine.run(script)
}
