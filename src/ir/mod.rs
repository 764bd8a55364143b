//! SSA intermediate representation
//!
//! A simple SSA-form IR for the Pascal front-end. It is the hand-off
//! surface to the code-generation backend: easy to produce from the
//! typed AST, easy to translate further.

// Note: instr must come before types to avoid circular deps
mod instr;
mod types;
mod builder;
pub mod runtime;
mod lower;

// Re-export in logical order
pub use instr::*;
pub use types::*;
pub use builder::*;
pub use lower::*;
