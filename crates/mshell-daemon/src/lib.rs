//! mshell Daemon Library
//!
//! Hosts one command interpreter and shares it between every client that
//! joins through the rendezvous. Clients are chained in join order:
//! - [`interpreter`]: spawning and stopping the interpreter process
//! - [`session`]: the per-client relay state machine
//! - [`chain`]: wiring each new client onto the end of the chain
//! - [`server`]: the accept loop and the supervisor that reaps sessions

pub mod chain;
pub mod config;
pub mod interpreter;
pub mod server;
pub mod session;

pub use config::{RelayOptions, ServerConfig};
pub use interpreter::{InterpreterHost, InterpreterLink};
pub use server::{Server, ServerError, ServerReport, ShutdownCause};
pub use session::{CloseReason, SessionExit, SessionId};
