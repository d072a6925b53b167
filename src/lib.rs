//! Lox - a bytecode compiler and stack-based virtual machine
//!
//! Source text is lowered by a single-pass compiler into bytecode, which
//! a frame-stack interpreter executes immediately. All heap objects are
//! managed by a precise mark-sweep garbage collector; strings are
//! interned.

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod gc;
pub mod lexer;
pub mod table;
pub mod token;
pub mod value;
pub mod vm;

pub use error::{Error, RuntimeError};
pub use value::Value;
pub use vm::VM;

/// Convenience function to run Lox code in a fresh VM
pub fn run(source: &str) -> Result<(), Error> {
    let mut vm = VM::new();
    vm.interpret(source)
}

/// Version of the interpreter
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
