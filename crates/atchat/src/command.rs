//! Outbound commands and the queue they wait in.
//!
//! The queue is strictly FIFO. Only the head is ever written to the transport,
//! and it stays at the head until a terminator resolves it, so at most one
//! command is in flight at a time.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::result::AtResult;

/// Ctrl-Z, ends the data part of a prompt-driven command.
pub const CTRL_Z: u8 = 0x1A;

/// Identifies a submitted command. Id 0 belongs to the wakeup command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u32);

impl CommandId {
    pub const WAKEUP: CommandId = CommandId(0);
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Identifies the logical user of a shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl GroupId {
    /// The group of the handle returned by `Chat::open`; also tags the
    /// engine's own wakeup commands.
    pub const PRIMARY: GroupId = GroupId(0);
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Why the engine let go of a command or notification registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The command was resolved (successfully or not).
    Completed,
    /// The command or registration was canceled, unregistered or torn down.
    Canceled,
}

pub type CompleteFn = Box<dyn FnOnce(bool, &AtResult)>;
pub type ListingFn = Box<dyn FnMut(&AtResult)>;
pub type ReleaseFn = Box<dyn FnOnce(Release)>;

/// Append the line terminator: `\r`, or Ctrl-Z when the command already
/// carries an embedded `\r` for a data prompt.
pub fn encode_command(command: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(command.len() + 1);
    buf.put_slice(command.as_bytes());

    if command.contains('\r') {
        buf.put_u8(CTRL_Z);
    } else {
        buf.put_u8(b'\r');
    }

    buf.freeze()
}

// ============================================================================
// Command request
// ============================================================================

/// Everything needed to queue a command.
///
/// ```
/// use atchat::CommandRequest;
///
/// let request = CommandRequest::new("AT+CREG?")
///     .prefixes(["+CREG:"])
///     .on_complete(|ok, result| println!("{ok} {:?}", result.lines()));
/// ```
pub struct CommandRequest {
    pub(crate) command: String,
    pub(crate) prefixes: Option<Vec<String>>,
    pub(crate) expect_pdu: bool,
    pub(crate) expect_short_prompt: bool,
    pub(crate) listing: Option<ListingFn>,
    pub(crate) on_complete: Option<CompleteFn>,
    pub(crate) on_release: Option<ReleaseFn>,
    pub(crate) timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        CommandRequest {
            command: command.into(),
            prefixes: None,
            expect_pdu: false,
            expect_short_prompt: false,
            listing: None,
            on_complete: None,
            on_release: None,
            timeout: None,
        }
    }

    /// Only lines starting with one of these prefixes belong to the response.
    /// Without a prefix list every non-terminator line does; an empty list
    /// accepts none.
    pub fn prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    /// Response lines are headers each followed by a PDU line. A listing
    /// gets each pair as one result; without one, header and PDU are
    /// collected as consecutive lines of the completion result.
    pub fn expect_pdu(mut self) -> Self {
        self.expect_pdu = true;
        self
    }

    /// The modem answers the embedded `\r` with a short prompt.
    pub fn expect_short_prompt(mut self) -> Self {
        self.expect_short_prompt = true;
        self
    }

    /// Deliver response lines one at a time instead of collecting them.
    pub fn listing(mut self, listing: impl FnMut(&AtResult) + 'static) -> Self {
        self.listing = Some(Box::new(listing));
        self
    }

    pub fn on_complete(mut self, on_complete: impl FnOnce(bool, &AtResult) + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }

    /// Called exactly once when the engine drops the command.
    pub fn on_release(mut self, on_release: impl FnOnce(Release) + 'static) -> Self {
        self.on_release = Some(Box::new(on_release));
        self
    }

    /// Fail the command if it is not resolved within `timeout` of being
    /// written.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRequest")
            .field("command", &self.command)
            .field("prefixes", &self.prefixes)
            .field("expect_pdu", &self.expect_pdu)
            .field("expect_short_prompt", &self.expect_short_prompt)
            .field("listing", &self.listing.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Pending command
// ============================================================================

/// A command owned by the queue.
pub(crate) struct PendingCommand {
    pub id: CommandId,
    pub group: GroupId,
    pub bytes: Bytes,
    pub prefixes: Option<Vec<String>>,
    pub expect_pdu: bool,
    pub expect_short_prompt: bool,
    pub on_complete: Option<CompleteFn>,
    pub listing: Option<ListingFn>,
    pub on_release: Option<ReleaseFn>,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    /// When the first byte went out.
    pub written_at: Option<Instant>,
    canceled: bool,
}

impl PendingCommand {
    pub fn from_request(id: CommandId, group: GroupId, request: CommandRequest) -> Self {
        PendingCommand {
            id,
            group,
            bytes: encode_command(&request.command),
            prefixes: request.prefixes,
            expect_pdu: request.expect_pdu,
            expect_short_prompt: request.expect_short_prompt,
            on_complete: request.on_complete,
            listing: request.listing,
            on_release: request.on_release,
            timeout: request.timeout,
            deadline: None,
            written_at: None,
            canceled: false,
        }
    }

    /// The wakeup probe: written verbatim, accepts no response lines.
    pub fn wakeup(command: &str) -> Self {
        PendingCommand {
            id: CommandId::WAKEUP,
            group: GroupId::PRIMARY,
            bytes: Bytes::copy_from_slice(command.as_bytes()),
            prefixes: Some(Vec::new()),
            expect_pdu: false,
            expect_short_prompt: false,
            on_complete: None,
            listing: None,
            on_release: None,
            timeout: None,
            deadline: None,
            written_at: None,
            canceled: false,
        }
    }

    pub fn is_wakeup(&self) -> bool {
        self.id == CommandId::WAKEUP
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Whether `line` belongs to this command's response.
    pub fn accepts(&self, line: &str) -> bool {
        match &self.prefixes {
            None => true,
            Some(prefixes) => prefixes.iter().any(|p| line.starts_with(p.as_str())),
        }
    }

    /// Silence a command that cannot leave the queue. Returns the callbacks
    /// so the caller drops them outside any engine borrow.
    pub fn mute(&mut self) -> Discarded {
        self.canceled = true;
        Discarded::Callbacks {
            on_complete: self.on_complete.take(),
            listing: self.listing.take(),
        }
    }

    /// Mark the command as canceled before it is dropped.
    pub fn into_canceled(mut self) -> Self {
        self.canceled = true;
        self
    }
}

impl Drop for PendingCommand {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            let reason = if self.canceled {
                Release::Canceled
            } else {
                Release::Completed
            };
            on_release(reason);
        }
    }
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommand")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("bytes", &self.bytes)
            .field("prefixes", &self.prefixes)
            .field("canceled", &self.canceled)
            .finish()
    }
}

/// State removed from the engine that must be dropped after every engine
/// borrow is released, since dropping user closures can re-enter the engine.
#[must_use]
// Payloads are never read, only held until the drop point.
#[allow(dead_code)]
pub(crate) enum Discarded {
    Command(PendingCommand),
    Callbacks {
        on_complete: Option<CompleteFn>,
        listing: Option<ListingFn>,
    },
}

// ============================================================================
// Command queue
// ============================================================================

/// FIFO of pending commands plus the write progress of the head.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: VecDeque<PendingCommand>,
    bytes_written: usize,
}

impl CommandQueue {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn try_reserve(&mut self) -> Result<(), std::collections::TryReserveError> {
        self.commands.try_reserve(1)
    }

    pub fn push_back(&mut self, command: PendingCommand) {
        self.commands.push_back(command);
    }

    /// Put a command ahead of the head. Only valid while the head has not
    /// been written.
    pub fn push_front(&mut self, command: PendingCommand) {
        debug_assert_eq!(self.bytes_written, 0);
        self.commands.push_front(command);
    }

    pub fn head(&self) -> Option<&PendingCommand> {
        self.commands.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut PendingCommand> {
        self.commands.front_mut()
    }

    /// Remove the head and reset write progress.
    pub fn pop_front(&mut self) -> Option<PendingCommand> {
        self.bytes_written = 0;
        self.commands.pop_front()
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn advance(&mut self, n: usize) {
        self.bytes_written += n;
    }

    /// Whether the head is fully written.
    pub fn head_complete(&self) -> bool {
        self.head()
            .is_some_and(|cmd| self.bytes_written >= cmd.bytes.len())
    }

    /// Whether the head has written a segment end (`\r`, `\n` or Ctrl-Z), so a
    /// result code from the modem can refer to it.
    pub fn awaiting_response(&self) -> bool {
        self.last_written_byte()
            .is_some_and(|b| b == b'\r' || b == b'\n' || b == CTRL_Z)
    }

    pub fn last_written_byte(&self) -> Option<u8> {
        let head = self.head()?;
        if self.bytes_written == 0 {
            return None;
        }
        head.bytes.get(self.bytes_written - 1).copied()
    }

    /// The next chunk of the head to write: up to and including the next
    /// `\r`, or everything that is left.
    pub fn next_segment(&self) -> Option<Bytes> {
        let head = self.head()?;
        let rest = head.bytes.slice(self.bytes_written.min(head.bytes.len())..);

        match rest.iter().position(|&b| b == b'\r') {
            Some(cr) => Some(rest.slice(..=cr)),
            None => Some(rest),
        }
    }

    pub fn position(&self, id: CommandId) -> Option<usize> {
        self.commands.iter().position(|c| c.id == id)
    }

    pub fn is_pending(&self, group: GroupId, id: CommandId) -> bool {
        self.commands
            .iter()
            .any(|c| c.id == id && c.group == group && !c.is_canceled())
    }

    /// Cancel one command of `group`. Returns `None` if there is no such
    /// command.
    pub fn cancel(&mut self, group: GroupId, id: CommandId) -> Option<Discarded> {
        let index = self.position(id)?;

        if self.commands[index].group != group {
            return None;
        }

        if index == 0 && self.bytes_written > 0 {
            return Some(self.commands[0].mute());
        }

        self.commands
            .remove(index)
            .map(|c| Discarded::Command(c.into_canceled()))
    }

    /// Cancel every command of `group` except wakeups.
    pub fn cancel_group(&mut self, group: GroupId) -> Vec<Discarded> {
        let mut discarded = Vec::new();
        let mut index = 0;

        while index < self.commands.len() {
            let cmd = &self.commands[index];
            if cmd.is_wakeup() || cmd.group != group {
                index += 1;
                continue;
            }

            if index == 0 && self.bytes_written > 0 {
                if !self.commands[0].is_canceled() {
                    discarded.push(self.commands[0].mute());
                }
                index += 1;
                continue;
            }

            if let Some(cmd) = self.commands.remove(index) {
                discarded.push(Discarded::Command(cmd.into_canceled()));
            }
        }

        discarded
    }

    /// Empty the queue, marking everything canceled.
    pub fn drain_canceled(&mut self) -> Vec<Discarded> {
        self.bytes_written = 0;
        self.commands
            .drain(..)
            .map(|c| Discarded::Command(c.into_canceled()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn pending(id: u32, group: u32, cmd: &str) -> PendingCommand {
        PendingCommand::from_request(
            CommandId(id),
            GroupId(group),
            CommandRequest::new(cmd),
        )
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(&encode_command("AT+CREG?")[..], b"AT+CREG?\r");
        assert_eq!(&encode_command("AT+CMGS=10\r0011")[..], b"AT+CMGS=10\r0011\x1a");
    }

    #[test]
    fn test_next_segment_stops_after_cr() {
        let mut queue = CommandQueue::default();
        queue.push_back(pending(1, 0, "AT+CMGS=3\rABC"));

        assert_eq!(&queue.next_segment().unwrap()[..], b"AT+CMGS=3\r");
        queue.advance(10);
        assert!(queue.awaiting_response());
        assert_eq!(&queue.next_segment().unwrap()[..], b"ABC\x1a");
        queue.advance(4);
        assert!(queue.head_complete());
        assert_eq!(queue.last_written_byte(), Some(CTRL_Z));
    }

    #[test]
    fn test_partial_write_is_not_awaiting_response() {
        let mut queue = CommandQueue::default();
        queue.push_back(pending(1, 0, "AT"));
        queue.advance(1);

        assert!(!queue.awaiting_response());
        assert_eq!(&queue.next_segment().unwrap()[..], b"T\r");
    }

    #[test]
    fn test_accepts() {
        let any = pending(1, 0, "AT");
        assert!(any.accepts("whatever"));

        let mut none = pending(2, 0, "AT");
        none.prefixes = Some(Vec::new());
        assert!(!none.accepts("+CREG: 1"));

        let mut creg = pending(3, 0, "AT+CREG?");
        creg.prefixes = Some(vec!["+CREG:".into()]);
        assert!(creg.accepts("+CREG: 1"));
        assert!(!creg.accepts("+CGREG: 1"));
    }

    #[test]
    fn test_cancel_queued_fires_release_canceled() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let r = released.clone();

        let mut queue = CommandQueue::default();
        queue.push_back(pending(1, 0, "AT"));
        queue.push_back(PendingCommand::from_request(
            CommandId(2),
            GroupId(0),
            CommandRequest::new("AT+CSQ").on_release(move |why| r.borrow_mut().push(why)),
        ));

        let discarded = queue.cancel(GroupId(0), CommandId(2));
        assert!(discarded.is_some());
        assert!(released.borrow().is_empty());
        drop(discarded);

        assert_eq!(*released.borrow(), vec![Release::Canceled]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cancel_in_flight_mutes() {
        let mut queue = CommandQueue::default();
        let mut request = pending(1, 0, "AT+COPS?");
        request.on_complete = Some(Box::new(|_, _| panic!("muted command completed")));
        queue.push_back(request);
        queue.advance(3);

        let discarded = queue.cancel(GroupId(0), CommandId(1));
        assert!(matches!(discarded, Some(Discarded::Callbacks { on_complete: Some(_), .. })));
        assert_eq!(queue.len(), 1);
        assert!(queue.head().unwrap().is_canceled());
        assert!(queue.head().unwrap().on_complete.is_none());
        assert!(!queue.is_pending(GroupId(0), CommandId(1)));
    }

    #[test]
    fn test_cancel_wrong_group() {
        let mut queue = CommandQueue::default();
        queue.push_back(pending(1, 1, "AT"));

        assert!(queue.cancel(GroupId(2), CommandId(1)).is_none());
        assert!(queue.is_pending(GroupId(1), CommandId(1)));
    }

    #[test]
    fn test_cancel_group_keeps_others_and_wakeup() {
        let mut queue = CommandQueue::default();
        queue.push_back(PendingCommand::wakeup("AT\r"));
        queue.push_back(pending(1, 1, "AT+A"));
        queue.push_back(pending(2, 2, "AT+B"));
        queue.push_back(pending(3, 1, "AT+C"));

        let discarded = queue.cancel_group(GroupId(1));
        assert_eq!(discarded.len(), 2);

        let ids: Vec<_> = (0..queue.len()).map(|i| queue.commands[i].id.0).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn test_drain_canceled_resets_progress() {
        let mut queue = CommandQueue::default();
        queue.push_back(pending(1, 0, "AT"));
        queue.advance(2);

        assert_eq!(queue.drain_canceled().len(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.bytes_written(), 0);
    }
}
