// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Single-pass, precedence-climbing compiler. Parses and emits bytecode
//! in the same walk — there is no intermediate AST. Every allocation
//! (interned names, nested function objects) goes through the heap that
//! is threaded through every method, which is also how the in-progress
//! function chain stays reachable as a GC root while compiling (see
//! [`Compiler`]'s [`GcRoots`] impl).

pub mod disassemble;

use crate::bytecode::{Chunk, OpCode};
use crate::error::CompileError;
use crate::heap::{GcRoots, Heap, ObjRef};
use crate::reader::lexer::{Scanner, Token, TokenKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash | Percent => Precedence::Factor,
        Bang | LeftParen | Dot | LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// `None` while the initializer is still being compiled — reading the
    /// name in that window is the "own initializer" error.
    depth: Option<u32>,
    is_captured: bool,
}

struct UpvalueDesc {
    is_local: bool,
    index: u8,
}

struct LoopCtx {
    loop_start: usize,
    depth: u32,
    break_jumps: Vec<usize>,
}

struct FunctionScope {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local>,
    depth: u32,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopCtx>,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Drives the whole parse. Holds one [`FunctionScope`] per nested
/// function currently being compiled, innermost last.
pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    scopes: Vec<FunctionScope>,
}

/// Keeps every function currently under construction reachable: a
/// collection triggered by interning a string constant mid-compile must
/// not free the chunk that string is about to be added to.
impl GcRoots for Compiler<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for scope in &self.scopes {
            heap.mark_object(scope.function);
        }
    }
}

/// Compiles `source` into a top-level script function. Returns the first
/// error encountered; the scanner still resynchronizes past the offending
/// statement internally so later, unrelated errors don't cascade, but
/// only the first is surfaced to the caller.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(source, heap)?;
    let mut first_error = None;
    while !compiler.check(TokenKind::Eof) {
        if let Err(e) = compiler.declaration(heap) {
            if first_error.is_none() {
                first_error = Some(e);
            }
            compiler.panic_mode = true;
            compiler.synchronize();
        }
    }
    compiler.emit_op(heap, OpCode::Null);
    compiler.emit_op(heap, OpCode::Return);
    let script = compiler.scopes.pop().unwrap().function;
    match first_error {
        Some(e) => Err(e),
        None => Ok(script),
    }
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str, heap: &mut Heap) -> Result<Self, CompileError> {
        let mut scanner = Scanner::new(source);
        let current = scanner.next_token();
        let script_fn = heap.alloc_function(None, 0, &Vec::<ObjRef>::new());
        let mut compiler = Compiler {
            scanner,
            previous: current,
            current,
            had_error: false,
            panic_mode: false,
            scopes: vec![FunctionScope {
                function: script_fn,
                kind: FunctionKind::Script,
                locals: vec![Local {
                    name: String::new(),
                    depth: Some(0),
                    is_captured: false,
                }],
                depth: 0,
                upvalues: Vec::new(),
                loops: Vec::new(),
            }],
        };
        compiler.previous = current;
        Ok(compiler)
    }

    fn root_snapshot(&self) -> Vec<ObjRef> {
        self.scopes.iter().map(|s| s.function).collect()
    }

    // ---- token plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.had_error = true;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, what: &str) -> Result<(), CompileError> {
        if self.check(kind) {
            self.advance();
            return Ok(());
        }
        Err(CompileError::UnexpectedToken {
            line: self.current.line,
            lexeme: format!("{what}, found '{}'", self.current.lexeme),
        })
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            if matches!(
                self.current.kind,
                Class | Func | Let | For | If | While | Print | Return | Break
            ) {
                return;
            }
            self.advance();
        }
    }

    // ---- bytecode emission ----------------------------------------------

    fn current_chunk<'h>(&self, heap: &'h mut Heap) -> &'h mut Chunk {
        let function = self.scopes.last().expect("at least the script scope").function;
        &mut heap.function_mut(function).chunk
    }

    fn emit_byte(&mut self, heap: &mut Heap, byte: u8) {
        let line = self.previous.line;
        self.current_chunk(heap).write(byte, line);
    }

    fn emit_op(&mut self, heap: &mut Heap, op: OpCode) {
        self.emit_byte(heap, op as u8);
    }

    fn emit_op_u8(&mut self, heap: &mut Heap, op: OpCode, operand: u8) {
        self.emit_op(heap, op);
        self.emit_byte(heap, operand);
    }

    fn emit_jump(&mut self, heap: &mut Heap, op: OpCode) -> usize {
        let line = self.previous.line;
        self.current_chunk(heap).emit_jump(op, line)
    }

    fn patch_jump(&mut self, heap: &mut Heap, at: usize) -> Result<(), CompileError> {
        let line = self.previous.line;
        self.current_chunk(heap).patch_jump(at, line)
    }

    fn emit_loop(&mut self, heap: &mut Heap, loop_start: usize) -> Result<(), CompileError> {
        let line = self.previous.line;
        self.current_chunk(heap).emit_loop(loop_start, line)
    }

    fn emit_pops(&mut self, heap: &mut Heap, count: u32) {
        if count == 0 {
            return;
        }
        let mut remaining = count;
        while remaining > 255 {
            self.emit_op_u8(heap, OpCode::PopN, 255);
            remaining -= 255;
        }
        if remaining == 1 {
            self.emit_op(heap, OpCode::Pop);
        } else {
            self.emit_op_u8(heap, OpCode::PopN, remaining as u8);
        }
    }

    fn make_constant(&mut self, heap: &mut Heap, value: Value) -> Result<u8, CompileError> {
        let line = self.previous.line;
        self.current_chunk(heap).add_constant(value, line)
    }

    fn identifier_constant(&mut self, heap: &mut Heap, name: &str) -> Result<u8, CompileError> {
        let roots = self.root_snapshot();
        let interned = heap.intern(name, &roots);
        self.make_constant(heap, Value::Object(interned))
    }

    // ---- declarations & statements ---------------------------------------

    fn declaration(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        if self.matches(TokenKind::Func) {
            self.func_declaration(heap)
        } else if self.matches(TokenKind::Let) {
            self.let_declaration(heap)
        } else if self.matches(TokenKind::Class) {
            self.class_declaration(heap)
        } else {
            self.statement(heap)
        }
    }

    fn func_declaration(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.consume(TokenKind::Identifier, "expect function name")?;
        let name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let global = self.declare_or_global(heap, &name, line)?;
        if self.current_scope().depth > 0 {
            self.mark_initialized();
        }
        self.function(heap, FunctionKind::Function, &name)?;
        self.define_variable(heap, global);
        Ok(())
    }

    fn let_declaration(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.consume(TokenKind::Identifier, "expect variable name")?;
        let name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let global = self.declare_or_global(heap, &name, line)?;
        if self.matches(TokenKind::Equal) {
            self.expression(heap)?;
        } else {
            self.emit_op(heap, OpCode::Null);
        }
        self.consume(TokenKind::Semicolon, "expect ';' after variable declaration")?;
        self.define_variable(heap, global);
        Ok(())
    }

    fn class_declaration(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.consume(TokenKind::Identifier, "expect class name")?;
        let class_name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let name_idx = self.identifier_constant(heap, &class_name)?;
        let global = self.declare_or_global(heap, &class_name, line)?;
        self.emit_op_u8(heap, OpCode::Class, name_idx);
        self.define_variable(heap, global);

        self.named_variable(heap, &class_name, false)?;
        self.consume(TokenKind::LeftBrace, "expect '{' before class body")?;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap, &class_name)?;
        }
        self.consume(TokenKind::RightBrace, "expect '}' after class body")?;
        self.emit_op(heap, OpCode::Pop);
        Ok(())
    }

    fn method(&mut self, heap: &mut Heap, class_name: &str) -> Result<(), CompileError> {
        self.consume(TokenKind::Identifier, "expect method name")?;
        let method_name = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(heap, &method_name)?;
        let kind = if method_name == class_name {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(heap, kind, &method_name)?;
        self.emit_op_u8(heap, OpCode::Method, name_idx);
        Ok(())
    }

    /// Declares `name` as a local if we're nested, or returns its global
    /// constant index otherwise.
    fn declare_or_global(
        &mut self,
        heap: &mut Heap,
        name: &str,
        line: u32,
    ) -> Result<Option<u8>, CompileError> {
        if self.current_scope().depth == 0 {
            return self.identifier_constant(heap, name).map(Some);
        }
        self.declare_local(name, line)?;
        Ok(None)
    }

    fn declare_local(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        let scope = self.current_scope();
        let depth = scope.depth;
        for local in scope.locals.iter().rev() {
            if local.depth.is_some_and(|d| d < depth) {
                break;
            }
            if local.name == name {
                return Err(CompileError::DuplicateLocal {
                    line,
                    name: name.to_string(),
                });
            }
        }
        if scope.locals.len() >= MAX_LOCALS {
            return Err(CompileError::TooManyLocals { line });
        }
        scope.locals.push(Local {
            name: name.to_string(),
            depth: None,
            is_captured: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        let scope = self.current_scope();
        let depth = scope.depth;
        if let Some(local) = scope.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, heap: &mut Heap, global: Option<u8>) {
        match global {
            Some(idx) => self.emit_op_u8(heap, OpCode::DefineGlobal, idx),
            None => self.mark_initialized(),
        }
    }

    fn current_scope(&mut self) -> &mut FunctionScope {
        self.scopes.last_mut().expect("at least the script scope")
    }

    fn begin_scope(&mut self) {
        self.current_scope().depth += 1;
    }

    fn end_scope(&mut self, heap: &mut Heap) {
        let scope_idx = self.scopes.len() - 1;
        self.scopes[scope_idx].depth -= 1;
        let depth = self.scopes[scope_idx].depth;
        let mut popped = Vec::new();
        while let Some(local) = self.scopes[scope_idx].locals.last() {
            if local.depth.is_some_and(|d| d > depth) {
                popped.push(self.scopes[scope_idx].locals.pop().unwrap().is_captured);
            } else {
                break;
            }
        }
        let mut pending = 0u32;
        for captured in popped {
            if captured {
                self.emit_pops(heap, pending);
                pending = 0;
                self.emit_op(heap, OpCode::CloseUpvalue);
            } else {
                pending += 1;
            }
        }
        self.emit_pops(heap, pending);
    }

    fn statement(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        if self.matches(TokenKind::Print) {
            self.print_statement(heap)
        } else if self.matches(TokenKind::If) {
            self.if_statement(heap)
        } else if self.matches(TokenKind::While) {
            self.while_statement(heap)
        } else if self.matches(TokenKind::For) {
            self.for_statement(heap)
        } else if self.matches(TokenKind::Return) {
            self.return_statement(heap)
        } else if self.matches(TokenKind::Break) {
            self.break_statement(heap)
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap)?;
            self.end_scope(heap);
            Ok(())
        } else {
            self.expression_statement(heap)
        }
    }

    fn block(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if let Err(e) = self.declaration(heap) {
                if !self.panic_mode {
                    self.panic_mode = true;
                    self.synchronize();
                    return Err(e);
                }
            }
        }
        self.consume(TokenKind::RightBrace, "expect '}' after block")
    }

    fn print_statement(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.expression(heap)?;
        self.consume(TokenKind::Semicolon, "expect ';' after value")?;
        self.emit_op(heap, OpCode::Print);
        Ok(())
    }

    fn expression_statement(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.expression(heap)?;
        self.consume(TokenKind::Semicolon, "expect ';' after expression")?;
        self.emit_op(heap, OpCode::Pop);
        Ok(())
    }

    fn if_statement(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.consume(TokenKind::LeftParen, "expect '(' after 'if'")?;
        self.expression(heap)?;
        self.consume(TokenKind::RightParen, "expect ')' after condition")?;
        let then_jump = self.emit_jump(heap, OpCode::JumpIfFalse);
        self.emit_op(heap, OpCode::Pop);
        self.statement(heap)?;
        let else_jump = self.emit_jump(heap, OpCode::Jump);
        self.patch_jump(heap, then_jump)?;
        self.emit_op(heap, OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement(heap)?;
        }
        self.patch_jump(heap, else_jump)?;
        Ok(())
    }

    fn while_statement(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let loop_start = self.current_chunk(heap).code.len();
        let depth = self.current_scope().depth;
        self.current_scope().loops.push(LoopCtx {
            loop_start,
            depth,
            break_jumps: Vec::new(),
        });
        self.consume(TokenKind::LeftParen, "expect '(' after 'while'")?;
        self.expression(heap)?;
        self.consume(TokenKind::RightParen, "expect ')' after condition")?;
        let exit_jump = self.emit_jump(heap, OpCode::JumpIfFalse);
        self.emit_op(heap, OpCode::Pop);
        self.statement(heap)?;
        self.emit_loop(heap, loop_start)?;
        self.patch_jump(heap, exit_jump)?;
        self.emit_op(heap, OpCode::Pop);
        self.finish_loop(heap)
    }

    fn for_statement(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expect '(' after 'for'")?;
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Let) {
            self.let_declaration(heap)?;
        } else {
            self.expression_statement(heap)?;
        }

        let mut loop_start = self.current_chunk(heap).code.len();
        let depth = self.current_scope().depth;
        self.current_scope().loops.push(LoopCtx {
            loop_start,
            depth,
            break_jumps: Vec::new(),
        });

        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression(heap)?;
            self.consume(TokenKind::Semicolon, "expect ';' after loop condition")?;
            exit_jump = Some(self.emit_jump(heap, OpCode::JumpIfFalse));
            self.emit_op(heap, OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(heap, OpCode::Jump);
            let increment_start = self.current_chunk(heap).code.len();
            self.expression(heap)?;
            self.emit_op(heap, OpCode::Pop);
            self.consume(TokenKind::RightParen, "expect ')' after for clauses")?;
            self.emit_loop(heap, loop_start)?;
            loop_start = increment_start;
            self.patch_jump(heap, body_jump)?;
            self.current_scope().loops.last_mut().unwrap().loop_start = loop_start;
        }

        self.statement(heap)?;
        self.emit_loop(heap, loop_start)?;
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(heap, exit_jump)?;
            self.emit_op(heap, OpCode::Pop);
        }
        self.finish_loop(heap)?;
        self.end_scope(heap);
        Ok(())
    }

    fn finish_loop(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let loop_ctx = self.current_scope().loops.pop().expect("loop just pushed");
        for jump in loop_ctx.break_jumps {
            self.patch_jump(heap, jump)?;
        }
        Ok(())
    }

    fn break_statement(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let line = self.previous.line;
        let (loop_depth, pop_count) = {
            let scope = self.current_scope();
            let Some(loop_ctx) = scope.loops.last() else {
                return Err(CompileError::BreakOutsideLoop { line });
            };
            let loop_depth = loop_ctx.depth;
            let count = scope
                .locals
                .iter()
                .rev()
                .take_while(|l| l.depth.is_some_and(|d| d > loop_depth))
                .count() as u32;
            (loop_depth, count)
        };
        let _ = loop_depth;
        self.emit_pops(heap, pop_count);
        let jump = self.emit_jump(heap, OpCode::Jump);
        self.current_scope().loops.last_mut().unwrap().break_jumps.push(jump);
        self.consume(TokenKind::Semicolon, "expect ';' after 'break'")
    }

    fn return_statement(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let line = self.previous.line;
        if self.scopes.len() == 1 {
            return Err(CompileError::ReturnOutsideFunction { line });
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_implicit_return(heap);
            return Ok(());
        }
        if self.current_scope().kind == FunctionKind::Initializer {
            return Err(CompileError::ReturnValueFromInitializer { line });
        }
        self.expression(heap)?;
        self.consume(TokenKind::Semicolon, "expect ';' after return value")?;
        self.emit_op(heap, OpCode::Return);
        Ok(())
    }

    /// A bare `return;`, and the synthetic return every function body ends
    /// with: pushes `this` (slot 0) for an initializer so `new Thing()`
    /// evaluates to the instance rather than `null`, and `null` otherwise.
    fn emit_implicit_return(&mut self, heap: &mut Heap) {
        if self.current_scope().kind == FunctionKind::Initializer {
            self.emit_op_u8(heap, OpCode::GetLocal, 0);
        } else {
            self.emit_op(heap, OpCode::Null);
        }
        self.emit_op(heap, OpCode::Return);
    }

    // ---- functions ---------------------------------------------------

    fn function(
        &mut self,
        heap: &mut Heap,
        kind: FunctionKind,
        name: &str,
    ) -> Result<(), CompileError> {
        let roots = self.root_snapshot();
        let name_ref = heap.intern(name, &roots);
        let function = heap.alloc_function(Some(name_ref), 0, &self.root_snapshot());
        let receiver_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        self.scopes.push(FunctionScope {
            function,
            kind,
            locals: vec![Local {
                name: receiver_name.to_string(),
                depth: Some(0),
                is_captured: false,
            }],
            depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        });
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expect '(' after function name")?;
        let mut arity: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                arity += 1;
                self.consume(TokenKind::Identifier, "expect parameter name")?;
                let param = self.previous.lexeme.to_string();
                let line = self.previous.line;
                self.declare_local(&param, line)?;
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after parameters")?;
        self.consume(TokenKind::LeftBrace, "expect '{' before function body")?;
        self.block(heap)?;
        self.emit_implicit_return(heap);

        let scope = self.scopes.pop().expect("function scope just pushed");
        heap.function_mut(scope.function).arity = arity as u8;
        heap.function_mut(scope.function).upvalue_count = scope.upvalues.len() as u8;

        let const_idx = self.make_constant(heap, Value::Object(scope.function))?;
        self.emit_op_u8(heap, OpCode::Closure, const_idx);
        for upvalue in &scope.upvalues {
            self.emit_byte(heap, u8::from(upvalue.is_local));
            self.emit_byte(heap, upvalue.index);
        }
        Ok(())
    }

    // ---- variable resolution -------------------------------------------

    fn resolve_local_in(&self, scope_idx: usize, name: &str) -> Result<Option<u8>, CompileError> {
        let scope = &self.scopes[scope_idx];
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    return Err(CompileError::UseInOwnInitializer {
                        line: self.previous.line,
                        name: name.to_string(),
                    });
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Result<Option<u8>, CompileError> {
        if scope_idx == 0 {
            return Ok(None);
        }
        let parent_idx = scope_idx - 1;
        if let Some(local_slot) = self.resolve_local_in(parent_idx, name)? {
            self.scopes[parent_idx].locals[local_slot as usize].is_captured = true;
            return self.add_upvalue(scope_idx, true, local_slot).map(Some);
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(parent_idx, name)? {
            return self.add_upvalue(scope_idx, false, upvalue_slot).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, scope_idx: usize, is_local: bool, index: u8) -> Result<u8, CompileError> {
        let scope = &mut self.scopes[scope_idx];
        for (i, existing) in scope.upvalues.iter().enumerate() {
            if existing.is_local == is_local && existing.index == index {
                return Ok(i as u8);
            }
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            return Err(CompileError::TooManyUpvalues {
                line: self.previous.line,
            });
        }
        scope.upvalues.push(UpvalueDesc { is_local, index });
        Ok((scope.upvalues.len() - 1) as u8)
    }

    fn named_variable(&mut self, heap: &mut Heap, name: &str, can_assign: bool) -> Result<(), CompileError> {
        let scope_idx = self.scopes.len() - 1;
        let (get_op, set_op, operand) = if let Some(slot) = self.resolve_local_in(scope_idx, name)? {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(scope_idx, name)? {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(heap, name)?;
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression(heap)?;
            self.emit_op_u8(heap, set_op, operand);
        } else {
            self.emit_op_u8(heap, get_op, operand);
        }
        Ok(())
    }

    // ---- expressions ------------------------------------------------

    fn expression(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.parse_precedence(heap, Precedence::Assignment)
    }

    fn parse_precedence(&mut self, heap: &mut Heap, precedence: Precedence) -> Result<(), CompileError> {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        self.parse_prefix(heap, self.previous.kind, can_assign)?;

        while infix_precedence(self.current.kind) >= precedence {
            self.advance();
            self.parse_infix(heap, self.previous.kind, can_assign)?;
        }

        if can_assign && self.matches(TokenKind::Equal) {
            return Err(CompileError::InvalidAssignmentTarget {
                line: self.previous.line,
            });
        }
        Ok(())
    }

    fn parse_prefix(&mut self, heap: &mut Heap, kind: TokenKind, can_assign: bool) -> Result<(), CompileError> {
        match kind {
            TokenKind::Number => self.number(heap),
            TokenKind::String => self.string(heap),
            TokenKind::True => {
                self.emit_op(heap, OpCode::True);
                Ok(())
            }
            TokenKind::False => {
                self.emit_op(heap, OpCode::False);
                Ok(())
            }
            TokenKind::Null => {
                self.emit_op(heap, OpCode::Null);
                Ok(())
            }
            TokenKind::LeftParen => self.grouping(heap),
            TokenKind::Minus | TokenKind::Bang => self.unary(heap),
            TokenKind::Identifier => {
                let name = self.previous.lexeme.to_string();
                self.named_variable(heap, &name, can_assign)
            }
            TokenKind::This => self.named_variable(heap, "this", false),
            _ => Err(CompileError::UnexpectedToken {
                line: self.previous.line,
                lexeme: self.previous.lexeme.to_string(),
            }),
        }
    }

    fn parse_infix(&mut self, heap: &mut Heap, kind: TokenKind, can_assign: bool) -> Result<(), CompileError> {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | Percent | EqualEqual | BangEqual | Less | LessEqual
            | Greater | GreaterEqual => self.binary(heap),
            And => self.and(heap),
            Or => self.or(heap),
            LeftParen => self.call(heap),
            Dot => self.dot(heap, can_assign),
            LeftBracket => self.index(heap),
            Bang => {
                self.emit_op(heap, OpCode::Factorial);
                Ok(())
            }
            _ => unreachable!("infix_precedence only admits operator tokens"),
        }
    }

    fn number(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let value: f64 = self.previous.lexeme.parse().expect("scanner only emits valid numbers");
        let idx = self.make_constant(heap, Value::Number(value))?;
        self.emit_op_u8(heap, OpCode::Constant, idx);
        Ok(())
    }

    fn string(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let contents = Scanner::string_contents(self.previous).to_string();
        let roots = self.root_snapshot();
        let interned = heap.intern(&contents, &roots);
        let idx = self.make_constant(heap, Value::Object(interned))?;
        self.emit_op_u8(heap, OpCode::Constant, idx);
        Ok(())
    }

    fn grouping(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.expression(heap)?;
        self.consume(TokenKind::RightParen, "expect ')' after expression")
    }

    fn unary(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let operator = self.previous.kind;
        self.parse_precedence(heap, Precedence::Unary)?;
        match operator {
            TokenKind::Minus => self.emit_op(heap, OpCode::Negate),
            TokenKind::Bang => self.emit_op(heap, OpCode::Not),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let operator = self.previous.kind;
        let precedence = infix_precedence(operator);
        self.parse_precedence(heap, precedence.next())?;
        let op = match operator {
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Sub,
            TokenKind::Star => OpCode::Mul,
            TokenKind::Slash => OpCode::Div,
            TokenKind::Percent => OpCode::Modulo,
            TokenKind::EqualEqual => OpCode::Equals,
            TokenKind::BangEqual => OpCode::NotEquals,
            TokenKind::Less => OpCode::Less,
            TokenKind::LessEqual => OpCode::LessEqual,
            TokenKind::Greater => OpCode::Greater,
            TokenKind::GreaterEqual => OpCode::GreaterEqual,
            _ => unreachable!(),
        };
        self.emit_op(heap, op);
        Ok(())
    }

    fn and(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let end_jump = self.emit_jump(heap, OpCode::JumpIfFalse);
        self.emit_op(heap, OpCode::Pop);
        self.parse_precedence(heap, Precedence::And)?;
        self.patch_jump(heap, end_jump)
    }

    fn or(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let else_jump = self.emit_jump(heap, OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(heap, OpCode::Jump);
        self.patch_jump(heap, else_jump)?;
        self.emit_op(heap, OpCode::Pop);
        self.parse_precedence(heap, Precedence::Or)?;
        self.patch_jump(heap, end_jump)
    }

    fn call(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        let argc = self.argument_list(heap)?;
        self.emit_op_u8(heap, OpCode::Call, argc);
        Ok(())
    }

    fn argument_list(&mut self, heap: &mut Heap) -> Result<u8, CompileError> {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap)?;
                if argc == u8::MAX as u32 {
                    return Err(CompileError::TooManyArguments {
                        line: self.previous.line,
                    });
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after arguments")?;
        Ok(argc as u8)
    }

    /// `s[i]` — the subscript's own precedence forbids chained assignment
    /// (`s[i] = x` is not supported; indexing only ever reads).
    fn index(&mut self, heap: &mut Heap) -> Result<(), CompileError> {
        self.expression(heap)?;
        self.consume(TokenKind::RightBracket, "expect ']' after index")?;
        self.emit_op(heap, OpCode::Index);
        Ok(())
    }

    fn dot(&mut self, heap: &mut Heap, can_assign: bool) -> Result<(), CompileError> {
        self.consume(TokenKind::Identifier, "expect property name after '.'")?;
        let name = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(heap, &name)?;
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression(heap)?;
            self.emit_op_u8(heap, OpCode::SetField, name_idx);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list(heap)?;
            self.emit_op_u8(heap, OpCode::Invoke, name_idx);
            self.emit_byte(heap, argc);
        } else {
            self.emit_op_u8(heap, OpCode::GetField, name_idx);
        }
        Ok(())
    }
}
