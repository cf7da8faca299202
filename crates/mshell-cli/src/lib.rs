//! mshell CLI Library
//!
//! Attaches a local terminal to a shared mshell session.

pub mod multiplexer;

pub use multiplexer::{MultiplexerError, MultiplexerOptions, Termination, run_multiplexer};
