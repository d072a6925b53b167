//! Error types for the Lox compiler and virtual machine
//!
//! Compile-time diagnostics are printed to stderr as they are produced;
//! `interpret` only reports which phase failed. Runtime errors carry a
//! kind so the VM can print the message ahead of its stack trace.

use std::fmt;

/// Outcome of interpreting a piece of source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// One or more compile errors were reported
    Compile,
    /// A runtime error unwound the interpreter
    Runtime,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compile => write!(f, "compile error"),
            Error::Runtime => write!(f, "runtime error"),
        }
    }
}

impl std::error::Error for Error {}

/// Runtime error kinds raised by the VM
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Arity mismatch on a call
    WrongArity { expected: usize, got: usize },
    /// Call-frame limit exceeded
    StackOverflow,
    /// Calling a value that is neither a function nor a class
    NotCallable,
    /// Reading or assigning an undefined global
    UndefinedVariable(String),
    /// Property lookup failed on both fields and methods
    UndefinedProperty(String),
    /// Property access on a non-instance
    NoProperties,
    /// Method invocation on a non-instance
    NoMethods,
    /// Numeric operator applied to non-numbers
    OperandsMustBeNumbers,
    /// Negation applied to a non-number
    OperandMustBeNumber,
    /// `+` applied to anything but two numbers or two strings
    InvalidAddOperands,
    /// `class A < B` where `B` is not a class
    SuperclassMustBeClass,
    /// Error reported by a native function
    Native(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::WrongArity { expected, got } => {
                write!(f, "Expected {} arguments but got {}.", expected, got)
            }
            RuntimeError::StackOverflow => write!(f, "Stack overflow."),
            RuntimeError::NotCallable => write!(f, "Can only call functions and classes."),
            RuntimeError::UndefinedVariable(name) => {
                write!(f, "Undefined variable '{}'.", name)
            }
            RuntimeError::UndefinedProperty(name) => {
                write!(f, "Undefined property '{}'.", name)
            }
            RuntimeError::NoProperties => write!(f, "Only instances have properties."),
            RuntimeError::NoMethods => write!(f, "Only instances have methods."),
            RuntimeError::OperandsMustBeNumbers => write!(f, "Operands must be numbers."),
            RuntimeError::OperandMustBeNumber => {
                write!(f, "Operand to negation must be a number.")
            }
            RuntimeError::InvalidAddOperands => {
                write!(f, "Operands to '+' must be two strings or two numbers")
            }
            RuntimeError::SuperclassMustBeClass => write!(f, "Superclass must be a class."),
            RuntimeError::Native(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for RuntimeError {}
