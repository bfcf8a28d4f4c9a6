//! Session Module
//!
//! Drives one chat channel over TCP: applies the script's channel settings,
//! registers its notifications, queues its commands and pumps readiness and
//! timers into the engine until the commands are done and the listen window
//! has passed, the peer hangs up or the user interrupts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use atchat::{AtResult, Chat, Direction, Release};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::RunnerError;
use crate::script::ChatScript;
use crate::tcp_transport::TcpTransport;

/// Upper bound on how long the loop sleeps between checks of the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long to keep listening once every command has finished.
    pub listen: Duration,
    /// Dump raw traffic to stderr.
    pub debug: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            listen: Duration::ZERO,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Ok,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub status: CommandStatus,
    pub lines: Vec<String>,
    /// Final response line, absent on timeout or cancel.
    pub final_line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub prefix: String,
    pub lines: Vec<String>,
    pub pdu: Option<String>,
}

/// What happened during a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub commands: Vec<CommandOutcome>,
    pub notifications: Vec<NotificationRecord>,
    /// The peer hung up before the session ended on its own.
    pub disconnected: bool,
    /// The stop flag ended the session.
    pub interrupted: bool,
}

impl SessionSummary {
    /// Whether every command finished with a success terminator.
    pub fn all_ok(&self) -> bool {
        self.commands.iter().all(|c| c.status == CommandStatus::Ok)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Run `script` over `stream`.
pub async fn run_session(
    stream: TcpStream,
    script: &ChatScript,
    options: &SessionOptions,
    stop: Arc<AtomicBool>,
) -> Result<SessionSummary, RunnerError> {
    let (transport, link) = TcpTransport::new(stream);
    let chat = Chat::from_config(Box::new(transport), &script.chat)?;
    let io = chat.io();

    info!(
        channel = %chat.name(),
        peer = ?link.peer_addr(),
        commands = script.commands.len(),
        notifications = script.notifications.len(),
        "session started"
    );

    if options.debug {
        let name = chat.name().to_string();
        chat.set_debug(move |direction, bytes| print_traffic(&name, direction, bytes))?;
    }

    let summary = Rc::new(RefCell::new(SessionSummary::default()));

    {
        let summary = Rc::clone(&summary);
        chat.set_disconnect_function(move || {
            warn!("modem hung up");
            summary.borrow_mut().disconnected = true;
        })?;
    }

    for spec in &script.notifications {
        let summary = Rc::clone(&summary);
        let prefix = spec.prefix.clone();
        chat.register(&spec.prefix, spec.pdu, move |result: &AtResult| {
            info!(prefix = %prefix, lines = ?result.lines(), "notification");
            summary.borrow_mut().notifications.push(NotificationRecord {
                prefix: prefix.clone(),
                lines: result.lines().to_vec(),
                pdu: result.final_or_pdu().map(str::to_string),
            });
        })?;
    }

    let outstanding = Rc::new(Cell::new(0usize));

    for spec in &script.commands {
        let index = {
            let mut summary = summary.borrow_mut();
            summary.commands.push(CommandOutcome {
                command: spec.command.clone(),
                status: CommandStatus::Pending,
                lines: Vec::new(),
                final_line: None,
            });
            summary.commands.len() - 1
        };

        let on_complete = {
            let summary = Rc::clone(&summary);
            move |ok: bool, result: &AtResult| {
                let mut summary = summary.borrow_mut();
                let outcome = &mut summary.commands[index];
                outcome.status = if ok {
                    CommandStatus::Ok
                } else {
                    CommandStatus::Failed
                };
                outcome.lines = result.lines().to_vec();
                outcome.final_line = result.final_or_pdu().map(str::to_string);
                info!(
                    command = %outcome.command,
                    ok,
                    final_line = ?outcome.final_line,
                    "command finished"
                );
            }
        };

        let on_release = {
            let summary = Rc::clone(&summary);
            let outstanding = Rc::clone(&outstanding);
            move |release: Release| {
                let mut summary = summary.borrow_mut();
                let outcome = &mut summary.commands[index];
                if outcome.status == CommandStatus::Pending {
                    debug!(command = %outcome.command, ?release, "command dropped");
                    outcome.status = CommandStatus::Canceled;
                }
                outstanding.set(outstanding.get().saturating_sub(1));
            }
        };

        chat.submit(
            spec.to_request()
                .on_complete(on_complete)
                .on_release(on_release),
        )?;
        outstanding.set(outstanding.get() + 1);
    }

    let mut idle_since: Option<Instant> = None;

    loop {
        if stop.load(Ordering::SeqCst) {
            info!("interrupted");
            summary.borrow_mut().interrupted = true;
            break;
        }
        if !io.is_connected() {
            break;
        }

        let now = Instant::now();
        let mut wake = now + POLL_INTERVAL;

        if outstanding.get() == 0 {
            let since = *idle_since.get_or_insert(now);
            let listen_until = since + options.listen;
            if now >= listen_until {
                break;
            }
            wake = wake.min(listen_until);
        }
        if let Some(deadline) = io.next_deadline() {
            wake = wake.min(deadline);
        }

        tokio::select! {
            ready = link.readable(), if link.read_interest() => match ready {
                Ok(()) => io.on_readable(),
                Err(err) => {
                    warn!(%err, "socket not readable");
                    io.on_hangup();
                }
            },
            ready = link.writable(), if link.write_interest() => match ready {
                Ok(()) => io.on_writable(),
                Err(err) => {
                    warn!(%err, "socket not writable");
                    io.on_hangup();
                }
            },
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                io.handle_timeout();
            }
        }
    }

    // Dropping the last handle releases whatever is still queued.
    drop(io);
    drop(chat);

    let summary = summary.borrow().clone();
    info!(
        commands = summary.commands.len(),
        ok = summary.commands.iter().filter(|c| c.status == CommandStatus::Ok).count(),
        notifications = summary.notifications.len(),
        "session finished"
    );
    Ok(summary)
}

fn print_traffic(name: &str, direction: Direction, bytes: &[u8]) {
    eprintln!(
        "{} {} {} {}",
        chrono::Utc::now().format("%H:%M:%S%.3f"),
        name,
        direction,
        bytes.escape_ascii()
    );
}
