//! AT command chat engine for modem control channels.
//!
//! One [`Chat`] channel multiplexes textual AT commands over a single byte
//! stream. Commands are written strictly one at a time in submission order;
//! incoming lines are framed by a [`Syntax`], matched against the head
//! command's terminators and response prefixes, and everything that is not a
//! response goes to the notification handlers registered for its prefix.
//!
//! Several drivers share one channel by cloning the [`Chat`] handle. Each
//! clone acts for its own group, and dropping a clone cancels that group's
//! commands and notifications without touching anyone else's.
//!
//! The engine does no I/O scheduling of its own. The host watches the
//! transport and calls the [`ChatIo`] entry points when it is readable or
//! writable or when [`ChatIo::next_deadline`] passes.

pub mod chat;
pub mod clock;
pub mod command;
pub mod config;
mod engine;
pub mod error;
mod notify;
pub mod result;
pub mod ring_buffer;
pub mod syntax;
pub mod terminator;
mod tombstone;
pub mod transport;

pub use chat::{Chat, ChatIo};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{CommandId, CommandRequest, GroupId, Release, CTRL_Z};
pub use config::{ChatConfig, TerminatorConfig, WakeupConfig};
pub use engine::Lifecycle;
pub use error::{ChatError, ChatResult, ConfigError};
pub use notify::NotifyId;
pub use result::{AtResult, ResultIter};
pub use ring_buffer::RingBuffer;
pub use syntax::{GsmV1Syntax, PermissiveSyntax, Syntax, SyntaxHint, SyntaxKind, SyntaxResult};
pub use terminator::{BuiltinTerminator, TerminatorMatch, TerminatorRule};
pub use transport::{Direction, MemoryTransport, MemoryTransportHandle, Transport};
