//! Host runtime for the `atchat` engine.
//!
//! Connects a chat channel to a modem reachable over TCP (a serial bridge or
//! a modem emulator), runs a YAML [`ChatScript`] against it and reports what
//! came back.

pub mod error;
pub mod script;
pub mod session;
pub mod tcp_transport;

pub use error::RunnerError;
pub use script::{ChatScript, CommandSpec, NotificationSpec};
pub use session::{
    run_session, CommandOutcome, CommandStatus, NotificationRecord, SessionOptions, SessionSummary,
};
pub use tcp_transport::{TcpLink, TcpTransport};
