//! Pascal front-end
//!
//! A compiler front-end for an ISO-style Pascal dialect with object
//! extensions. It parses and resolves in a single pass and lowers the
//! typed AST to an SSA IR module for a code-generation backend.
//!
//! # Architecture
//!
//! ```text
//! Source Code (.pas)
//!       │
//!       ▼
//! ┌──────────────┐
//! │    Lexer     │  → Tokens
//! └──────────────┘
//!       │
//!       ▼
//! ┌──────────────┐
//! │Parser/Resolve│  → Typed AST  (types, scopes, closure conversion)
//! └──────────────┘
//!       │
//!       ▼
//! ┌──────────────┐
//! │  IR Lowering │  → SSA IR module
//! └──────────────┘
//!       │
//!       ▼
//!   backend (external)
//! ```

pub mod span;
pub mod token;
pub mod lexer;
pub mod consteval;
pub mod types;
pub mod ast;
pub mod names;
pub mod closure;
pub mod parser;
pub mod ir;

// Re-exports for convenience
pub use lexer::Lexer;
pub use span::Span;
pub use token::{Token, TokenKind};

/// Compiler version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File extension for Pascal source files
pub const FILE_EXTENSION: &str = "pas";
