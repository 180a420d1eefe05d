// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The lexical scanner: turns source text into a token stream. A thin
//! collaborator to the compiler, but implemented to the same standard as
//! the rest of the runtime rather than left as a stub.

pub mod lexer;

pub use lexer::{Scanner, Token, TokenKind};
