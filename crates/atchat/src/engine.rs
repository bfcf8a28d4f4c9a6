//! The chat engine shared by every handle on one channel.
//!
//! All state transitions happen synchronously inside the host entry points
//! (`receive`, `on_readable`, `on_writable`, `handle_timeout`, `on_hangup`)
//! or inside API calls. User callbacks run from those entry points and may
//! call straight back into the engine, so the engine never holds a `RefCell`
//! borrow across a callback, and anything that owns a user closure is
//! dropped only after the borrow is released.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use atchat_metrics::{metric_defs, Metric, MetricLabels};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::command::{
    CommandId, CommandQueue, CommandRequest, Discarded, GroupId, ListingFn, PendingCommand,
    ReleaseFn,
};
use crate::error::{ChatError, ChatResult};
use crate::notify::{NotificationRegistry, NotifyFn, NotifyId, NotifyMatch, NotifyNode, SharedNotifyFn};
use crate::result::AtResult;
use crate::ring_buffer::RingBuffer;
use crate::syntax::{Syntax, SyntaxHint, SyntaxResult};
use crate::terminator::{BuiltinTerminator, TerminatorRule, TerminatorSet};
use crate::transport::{Direction, Transport};

/// Size of a single transport read.
const READ_CHUNK: usize = 2048;

pub type DebugFn = Rc<dyn Fn(Direction, &[u8])>;
pub type DisconnectFn = Box<dyn FnOnce()>;

/// Where a channel is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting commands and traffic.
    Active,
    /// The transport went away; state has been flushed.
    Disconnected,
    /// The last handle was released while the read loop was running. The
    /// loop finishes the teardown when it unwinds.
    DestroyPending,
    /// Torn down.
    Destroyed,
}

// ============================================================================
// Engine state
// ============================================================================

struct WakeupState {
    command: String,
    response_timeout: Duration,
    inactivity: Duration,
    /// End of the last fully written command segment.
    last_activity: Option<Instant>,
    /// Pending "no response to wakeup" timer.
    deadline: Option<Instant>,
}

struct EngineState {
    buffer: RingBuffer,
    read_so_far: usize,
    syntax: Box<dyn Syntax>,
    queue: CommandQueue,
    notify: NotificationRegistry,
    terminators: TerminatorSet,
    /// Header line waiting for its PDU.
    pdu_header: Option<String>,
    response_lines: Vec<String>,
    wakeup: Option<WakeupState>,
    next_cmd_id: u32,
    next_notify_id: u32,
    strip_sequence_tags: bool,
}

impl EngineState {
    /// Pull the line framed by the last `read_so_far` bytes out of the buffer.
    ///
    /// Leading CR/LF are skipped and CR/LF inside double quotes do not end
    /// the line. The framed bytes are drained whatever the outcome.
    fn extract_line(&mut self) -> Option<String> {
        let mut line = Vec::new();

        if line.try_reserve(self.read_so_far).is_err() {
            warn!(bytes = self.read_so_far, "dropping line: out of memory");
            self.consume_framed();
            return None;
        }

        let mut in_string = false;
        let mut pos = 0;

        'scan: while pos < self.read_so_far {
            let chunk = self.buffer.read_ptr(pos);
            let chunk = &chunk[..chunk.len().min(self.read_so_far - pos)];

            for &byte in chunk {
                if !in_string && (byte == b'\r' || byte == b'\n') {
                    if !line.is_empty() {
                        break 'scan;
                    }
                } else {
                    if byte == b'"' {
                        in_string = !in_string;
                    }
                    line.push(byte);
                }
                pos += 1;
            }
        }

        self.consume_framed();

        if line.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }

    fn consume_framed(&mut self) {
        self.buffer.drain(self.read_so_far);
        self.read_so_far = 0;
    }

    fn allocate_cmd_id(&mut self) -> CommandId {
        let id = CommandId(self.next_cmd_id);
        self.next_cmd_id = self.next_cmd_id.wrapping_add(1).max(1);
        id
    }

    fn allocate_notify_id(&mut self) -> NotifyId {
        let id = NotifyId(self.next_notify_id);
        self.next_notify_id = self.next_notify_id.wrapping_add(1).max(1);
        id
    }

    /// Flush everything tied to the channel. The returned values must be
    /// dropped once the state borrow is gone.
    fn cleanup(&mut self) -> (Vec<Discarded>, Vec<NotifyNode>) {
        let commands = self.queue.drain_canceled();
        let nodes = self.notify.take_all();

        self.buffer.reset();
        self.read_so_far = 0;
        self.pdu_header = None;
        self.response_lines.clear();
        self.terminators.clear();
        if let Some(wakeup) = self.wakeup.as_mut() {
            wakeup.deadline = None;
        }

        (commands, nodes)
    }
}

/// Normalize a `U<4 digits>` sequence tag to `U0000`.
fn strip_sequence_tag(line: &mut String) {
    let bytes = line.as_bytes();
    if bytes.len() >= 5 && bytes[0] == b'U' && bytes[1..5].iter().all(u8::is_ascii_digit) {
        line.replace_range(1..5, "0000");
    }
}

/// How the head command takes a response line.
enum ResponseStep {
    Finish(bool),
    Consumed,
    Listing(CommandId, ListingFn),
    NotMine,
}

/// What the read loop found in the buffer.
enum ReadStep {
    Line(Option<String>),
    Pdu(Option<String>),
    Prompt,
    Nothing,
}

#[derive(Default)]
struct Hooks {
    debug: Option<DebugFn>,
    disconnect: Option<DisconnectFn>,
}

// ============================================================================
// Engine
// ============================================================================

pub(crate) struct ChatEngine {
    name: String,
    labels: MetricLabels,
    clock: Rc<dyn Clock>,
    state: RefCell<EngineState>,
    transport: RefCell<Option<Box<dyn Transport>>>,
    hooks: RefCell<Hooks>,
    lifecycle: Cell<Lifecycle>,
    handles: Cell<usize>,
    next_group: Cell<u32>,
    in_read_handler: Cell<bool>,
    in_notify: Cell<bool>,
    suspended: Cell<bool>,
    write_armed: Cell<bool>,
    max_read_attempts: Cell<u32>,
}

impl ChatEngine {
    /// Create the engine with one handle (the primary group) outstanding.
    pub fn new(
        name: &str,
        mut transport: Box<dyn Transport>,
        syntax: Box<dyn Syntax>,
        clock: Rc<dyn Clock>,
    ) -> Rc<ChatEngine> {
        transport.set_read_interest(true);

        debug!(channel = name, "chat channel opened");

        Rc::new(ChatEngine {
            name: name.to_string(),
            labels: MetricLabels::new(name),
            clock,
            state: RefCell::new(EngineState {
                buffer: RingBuffer::new(),
                read_so_far: 0,
                syntax,
                queue: CommandQueue::default(),
                notify: NotificationRegistry::default(),
                terminators: TerminatorSet::new(),
                pdu_header: None,
                response_lines: Vec::new(),
                wakeup: None,
                next_cmd_id: 1,
                next_notify_id: 1,
                strip_sequence_tags: false,
            }),
            transport: RefCell::new(Some(transport)),
            hooks: RefCell::new(Hooks::default()),
            lifecycle: Cell::new(Lifecycle::Active),
            handles: Cell::new(1),
            next_group: Cell::new(GroupId::PRIMARY.0 + 1),
            in_read_handler: Cell::new(false),
            in_notify: Cell::new(false),
            suspended: Cell::new(false),
            write_armed: Cell::new(false),
            max_read_attempts: Cell::new(crate::config::DEFAULT_MAX_READ_ATTEMPTS),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    fn is_active(&self) -> bool {
        self.lifecycle.get() == Lifecycle::Active
    }

    fn ensure_active(&self) -> ChatResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ChatError::Closed)
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.get()
    }

    pub fn wants_write(&self) -> bool {
        self.write_armed.get()
    }

    fn count(&self, metric: &Metric, n: u64) {
        metrics::counter!(metric.name, &self.labels.to_labels()).increment(n);
    }

    fn record_queue_depth(&self, depth: usize) {
        metrics::gauge!(metric_defs::QUEUE_DEPTH.name, &self.labels.to_labels()).set(depth as f64);
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Register a new handle and return its group.
    pub fn acquire_group(&self) -> GroupId {
        let group = GroupId(self.next_group.get());
        self.next_group.set(group.0.wrapping_add(1).max(1));
        self.handles.set(self.handles.get() + 1);
        group
    }

    /// Drop a handle: flush its group, and tear the engine down if it was the
    /// last one.
    pub fn release_group(&self, group: GroupId) {
        self.cancel_group(group);
        self.unregister_all(group);

        let remaining = self.handles.get().saturating_sub(1);
        self.handles.set(remaining);

        if remaining == 0 {
            self.teardown();
        }
    }

    fn teardown(&self) {
        let lifecycle = self.lifecycle.get();
        if lifecycle == Lifecycle::DestroyPending || lifecycle == Lifecycle::Destroyed {
            return;
        }

        debug!(channel = %self.name, "last handle released, tearing down");

        self.lifecycle.set(if self.in_read_handler.get() {
            Lifecycle::DestroyPending
        } else {
            Lifecycle::Destroyed
        });

        self.suspend();
        let transport = self.transport.borrow_mut().take();
        let flushed = self.state.borrow_mut().cleanup();
        let hooks = std::mem::take(&mut *self.hooks.borrow_mut());

        drop(transport);
        drop(flushed);
        drop(hooks);
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub fn submit(&self, group: GroupId, request: CommandRequest) -> ChatResult<CommandId> {
        self.ensure_active()?;

        let (id, depth) = {
            let mut state = self.state.borrow_mut();
            state.queue.try_reserve()?;

            let id = state.allocate_cmd_id();
            trace!(channel = %self.name, %id, %group, command = request.command(), "queueing command");
            state
                .queue
                .push_back(PendingCommand::from_request(id, group, request));
            (id, state.queue.len())
        };

        self.count(&metric_defs::COMMANDS_SUBMITTED, 1);
        self.record_queue_depth(depth);

        if depth == 1 {
            self.arm_writer();
        }

        Ok(id)
    }

    pub fn cancel(&self, group: GroupId, id: CommandId) -> bool {
        if !self.is_active() || id == CommandId::WAKEUP {
            return false;
        }

        let (discarded, depth) = {
            let mut state = self.state.borrow_mut();
            let discarded = state.queue.cancel(group, id);
            (discarded, state.queue.len())
        };

        let Some(discarded) = discarded else {
            return false;
        };

        debug!(channel = %self.name, %id, %group, "command canceled");
        self.count(&metric_defs::COMMANDS_CANCELED, 1);
        self.record_queue_depth(depth);
        drop(discarded);
        true
    }

    pub fn cancel_group(&self, group: GroupId) -> bool {
        if !self.is_active() {
            return false;
        }

        let (discarded, depth) = {
            let mut state = self.state.borrow_mut();
            let discarded = state.queue.cancel_group(group);
            (discarded, state.queue.len())
        };

        if !discarded.is_empty() {
            debug!(channel = %self.name, %group, count = discarded.len(), "group commands canceled");
            self.count(&metric_defs::COMMANDS_CANCELED, discarded.len() as u64);
            self.record_queue_depth(depth);
        }

        drop(discarded);
        true
    }

    pub fn is_pending(&self, group: GroupId, id: CommandId) -> bool {
        self.is_active() && self.state.borrow().queue.is_pending(group, id)
    }

    /// Pop the head and report its outcome.
    fn finish_command(&self, ok: bool, final_line: Option<String>) {
        let now = self.clock.now();

        let (mut cmd, lines, depth) = {
            let mut state = self.state.borrow_mut();
            let Some(cmd) = state.queue.pop_front() else {
                return;
            };

            if cmd.is_wakeup() {
                if let Some(wakeup) = state.wakeup.as_mut() {
                    if wakeup.deadline.take().is_some() {
                        debug!(channel = %self.name, "modem woke up");
                    }
                }
            }

            let lines = std::mem::take(&mut state.response_lines);
            (cmd, lines, state.queue.len())
        };

        if depth > 0 {
            self.arm_writer();
        }

        let outcome = if ok { "ok" } else { "error" };
        let labels = [("channel", self.name.clone()), ("outcome", outcome.to_string())];
        metrics::counter!(metric_defs::COMMANDS_COMPLETED.name, &labels).increment(1);
        if let Some(written_at) = cmd.written_at {
            let latency = now.saturating_duration_since(written_at);
            metrics::histogram!(metric_defs::RESPONSE_LATENCY.name, &self.labels.to_labels())
                .record(latency.as_secs_f64() * 1000.0);
        }
        self.record_queue_depth(depth);

        trace!(
            channel = %self.name,
            id = %cmd.id,
            ok,
            lines = lines.len(),
            "command finished"
        );

        if let Some(on_complete) = cmd.on_complete.take() {
            on_complete(ok, &AtResult::new(lines, final_line));
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    pub fn register(
        &self,
        group: GroupId,
        prefix: &str,
        expect_pdu: bool,
        callback: NotifyFn,
        on_release: Option<ReleaseFn>,
    ) -> ChatResult<NotifyId> {
        self.ensure_active()?;

        let mut state = self.state.borrow_mut();
        state.notify.check(prefix, expect_pdu)?;

        let id = state.allocate_notify_id();
        state
            .notify
            .insert(prefix, expect_pdu, NotifyNode::new(id, group, callback, on_release));

        trace!(
            channel = %self.name,
            %id,
            %group,
            prefix,
            expect_pdu,
            prefixes = state.notify.prefix_count(),
            "notification registered"
        );
        Ok(id)
    }

    pub fn unregister(&self, group: GroupId, id: NotifyId) -> bool {
        if !self.is_active() {
            return false;
        }

        let mark_only = self.in_notify.get();
        let removed = self.state.borrow_mut().notify.unregister(group, id, mark_only);

        match removed {
            Some(nodes) => {
                drop(nodes);
                true
            }
            None => false,
        }
    }

    pub fn unregister_all(&self, group: GroupId) -> bool {
        if !self.is_active() {
            return false;
        }

        let mark_only = self.in_notify.get();
        let removed = self.state.borrow_mut().notify.unregister_group(group, mark_only);
        drop(removed);
        true
    }

    /// Run handlers for one line with removal deferred to the end of the pass.
    fn dispatch(&self, handlers: Vec<(NotifyId, SharedNotifyFn)>, result: &AtResult) {
        let outer = self.in_notify.replace(true);

        for (id, callback) in handlers {
            if !self.is_active() {
                break;
            }
            if !self.state.borrow().notify.is_live(id) {
                continue;
            }

            (*callback.borrow_mut())(result);
            self.count(&metric_defs::NOTIFICATIONS_DISPATCHED, 1);
        }

        self.in_notify.set(outer);

        if !outer {
            let swept = self.state.borrow_mut().notify.sweep();
            drop(swept);
        }
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Feed bytes received from the transport.
    pub fn receive(&self, bytes: &[u8]) {
        if !self.is_active() || bytes.is_empty() {
            return;
        }

        if let Err(err) = self.state.borrow_mut().buffer.append(bytes) {
            warn!(channel = %self.name, bytes = bytes.len(), %err, "dropping received bytes");
            return;
        }

        self.count(&metric_defs::BYTES_RX, bytes.len() as u64);
        if !self.suspended.get() {
            self.debug_traffic(Direction::Rx, bytes);
        }

        // A callback feeding bytes lands here while the outer loop still runs;
        // that loop picks them up.
        if self.in_read_handler.get() {
            return;
        }

        self.process_buffer();
    }

    /// Read from the transport until it runs dry or the attempt budget is
    /// spent.
    pub fn on_readable(&self) {
        let mut chunk = [0u8; READ_CHUNK];

        for _ in 0..self.max_read_attempts.get() {
            if !self.is_active() || self.suspended.get() {
                return;
            }

            let read = match self.transport.borrow_mut().as_mut() {
                Some(transport) => transport.read(&mut chunk),
                None => return,
            };

            match read {
                Ok(0) => {
                    self.on_hangup();
                    return;
                }
                Ok(n) => self.receive(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(channel = %self.name, %err, "read failed");
                    self.on_hangup();
                    return;
                }
            }
        }
    }

    fn process_buffer(&self) {
        self.in_read_handler.set(true);

        while self.is_active() && !self.suspended.get() {
            let step = {
                let mut guard = self.state.borrow_mut();
                let state = &mut *guard;

                if state.read_so_far >= state.buffer.len() {
                    break;
                }

                let chunk = state.buffer.read_ptr(state.read_so_far);
                let (consumed, result) = state.syntax.feed(chunk);
                state.read_so_far += consumed;

                match result {
                    SyntaxResult::NeedMore if consumed == 0 => {
                        warn!(channel = %self.name, "syntax made no progress, discarding input");
                        state.consume_framed();
                        let rest = state.buffer.len();
                        state.buffer.drain(rest);
                        ReadStep::Nothing
                    }
                    SyntaxResult::NeedMore => continue,
                    SyntaxResult::Line | SyntaxResult::Multiline => {
                        ReadStep::Line(state.extract_line())
                    }
                    SyntaxResult::Pdu => ReadStep::Pdu(state.extract_line()),
                    SyntaxResult::Prompt => {
                        state.consume_framed();
                        ReadStep::Prompt
                    }
                    SyntaxResult::Unrecognized => {
                        state.consume_framed();
                        ReadStep::Nothing
                    }
                }
            };

            match step {
                ReadStep::Line(Some(line)) => self.have_line(line),
                ReadStep::Pdu(pdu) => self.have_pdu(pdu),
                ReadStep::Prompt => {
                    trace!(channel = %self.name, "prompt");
                    self.arm_writer();
                }
                ReadStep::Line(None) | ReadStep::Nothing => {}
            }
        }

        self.in_read_handler.set(false);

        if self.lifecycle.get() == Lifecycle::DestroyPending {
            debug!(channel = %self.name, "deferred teardown complete");
            self.lifecycle.set(Lifecycle::Destroyed);
        }
    }

    fn have_line(&self, mut line: String) {
        if self.state.borrow().strip_sequence_tags {
            strip_sequence_tag(&mut line);
        }

        if line.starts_with("AT") {
            trace!(channel = %self.name, %line, "dropping echo");
            return;
        }

        match self.command_response(&line) {
            ResponseStep::Finish(ok) => self.finish_command(ok, Some(line)),
            ResponseStep::Consumed => {}
            ResponseStep::Listing(id, mut listing) => {
                listing(&AtResult::single(line));
                self.restore_listing(id, listing);
            }
            ResponseStep::NotMine => {
                if !self.match_notify(line) {
                    self.count(&metric_defs::LINES_UNMATCHED, 1);
                }
            }
        }
    }

    /// Offer a line to the head command.
    fn command_response(&self, line: &str) -> ResponseStep {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        // A result code can only refer to the head once it has written a
        // segment end.
        if !state.queue.awaiting_response() {
            return ResponseStep::NotMine;
        }

        if let Some(ok) = state.terminators.classify(line) {
            return ResponseStep::Finish(ok);
        }

        let Some(head) = state.queue.head_mut() else {
            return ResponseStep::NotMine;
        };

        if !head.accepts(line) {
            return ResponseStep::NotMine;
        }

        state.syntax.set_hint(if head.expect_pdu {
            SyntaxHint::ExpectPdu
        } else {
            SyntaxHint::ExpectMultiline
        });

        if head.expect_pdu {
            state.pdu_header = Some(line.to_string());
            return ResponseStep::Consumed;
        }

        if let Some(listing) = head.listing.take() {
            return ResponseStep::Listing(head.id, listing);
        }

        state.response_lines.push(line.to_string());
        ResponseStep::Consumed
    }

    /// Give a listing callback back to its command if it is still the live
    /// head; otherwise drop it here, outside the borrow.
    fn restore_listing(&self, id: CommandId, listing: ListingFn) {
        let leftover = {
            let mut state = self.state.borrow_mut();
            match state.queue.head_mut() {
                Some(head) if head.id == id && !head.is_canceled() && head.listing.is_none() => {
                    head.listing = Some(listing);
                    None
                }
                _ => Some(listing),
            }
        };
        drop(leftover);
    }

    fn match_notify(&self, line: String) -> bool {
        let matched = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;

            match state.notify.matching(&line) {
                NotifyMatch::None => None,
                NotifyMatch::PduHeader => {
                    state.syntax.set_hint(SyntaxHint::ExpectPdu);
                    state.pdu_header = Some(line.clone());
                    Some(Vec::new())
                }
                NotifyMatch::Handlers(handlers) => Some(handlers),
            }
        };

        match matched {
            None => {
                trace!(channel = %self.name, %line, "ignoring unmatched line");
                false
            }
            Some(handlers) if handlers.is_empty() => true,
            Some(handlers) => {
                self.dispatch(handlers, &AtResult::single(line));
                true
            }
        }
    }

    fn have_pdu(&self, pdu: Option<String>) {
        let header = self.state.borrow_mut().pdu_header.take();

        let Some(pdu) = pdu else {
            return;
        };

        let Some(header) = header else {
            // Nothing announced a PDU; treat it as an ordinary line.
            self.have_line(pdu);
            return;
        };

        let listing = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let to_listing = state.queue.last_written_byte() == Some(b'\r')
                && state.queue.head().is_some_and(|h| h.expect_pdu);

            if to_listing {
                state.syntax.set_hint(SyntaxHint::ExpectMultiline);
                state.queue.head_mut().map(|head| {
                    let listing = head.listing.take();
                    if listing.is_none() && !head.is_canceled() {
                        // No listing: the pair joins the completion result.
                        state.response_lines.push(header.clone());
                        state.response_lines.push(pdu.clone());
                    }
                    (head.id, listing)
                })
            } else {
                None
            }
        };

        match listing {
            Some((id, Some(mut listing))) => {
                listing(&AtResult::new(vec![header], Some(pdu)));
                self.restore_listing(id, listing);
            }
            // Collected, or muted by a cancel.
            Some((_, None)) => {}
            None => {
                let handlers = self.state.borrow().notify.pdu_handlers(&header);
                if handlers.is_empty() {
                    self.count(&metric_defs::LINES_UNMATCHED, 1);
                } else {
                    self.dispatch(handlers, &AtResult::new(vec![header], Some(pdu)));
                }
            }
        }
    }

    // ========================================================================
    // Write path
    // ========================================================================

    pub(crate) fn arm_writer(&self) {
        if !self.is_active() || self.suspended.get() {
            return;
        }

        self.write_armed.set(true);
        if let Some(transport) = self.transport.borrow_mut().as_mut() {
            transport.set_write_interest(true);
        }
    }

    fn disarm_writer(&self) {
        self.write_armed.set(false);
        if let Some(transport) = self.transport.borrow_mut().as_mut() {
            transport.set_write_interest(false);
        }
    }

    /// The transport can take more data.
    pub fn on_writable(&self) {
        if !self.is_active() || self.suspended.get() || !self.write_armed.get() {
            return;
        }

        if !self.write_next() {
            self.disarm_writer();
        }
    }

    /// Write the next segment of the head command. Returns whether the writer
    /// should stay armed.
    fn write_next(&self) -> bool {
        let now = self.clock.now();

        let segment = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;

            let Some(head) = state.queue.head() else {
                return false;
            };
            if state.queue.head_complete() {
                return false;
            }

            if state.queue.bytes_written() == 0 && !head.is_wakeup() {
                if let Some(wakeup) = state.wakeup.as_mut() {
                    let due = wakeup
                        .last_activity
                        .map_or(true, |t| now.saturating_duration_since(t) > wakeup.inactivity);

                    if due {
                        debug!(channel = %self.name, "queueing wakeup ahead of command");
                        state.queue.push_front(PendingCommand::wakeup(&wakeup.command));
                        wakeup.deadline = Some(now + wakeup.response_timeout);
                        self.count(&metric_defs::WAKEUP_SENT, 1);
                    }
                }
            }

            state.queue.next_segment()
        };

        let Some(segment) = segment else {
            return false;
        };

        let written = match self.transport.borrow_mut().as_mut() {
            Some(transport) => transport.write(&segment),
            None => return false,
        };

        let written = match written {
            Ok(n) => n,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return true
            }
            Err(err) => {
                warn!(channel = %self.name, %err, "write failed");
                self.on_hangup();
                return false;
            }
        };

        if written == 0 {
            return false;
        }

        self.count(&metric_defs::BYTES_TX, written as u64);
        self.debug_traffic(Direction::Tx, &segment[..written]);

        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        let first_write = state.queue.bytes_written() == 0;
        state.queue.advance(written);

        if let Some(head) = state.queue.head_mut() {
            if first_write {
                head.written_at = Some(now);
                head.deadline = head.timeout.map(|t| now + t);
            }
        }

        if written < segment.len() {
            return true;
        }

        // The modem may answer the embedded CR before the OS reports the
        // write done, so hint the short prompt now.
        let bytes_written = state.queue.bytes_written();
        if let Some(head) = state.queue.head() {
            if head.expect_short_prompt && bytes_written < head.bytes.len() {
                state.syntax.set_hint(SyntaxHint::ExpectShortPrompt);
            }
        }

        if let Some(wakeup) = state.wakeup.as_mut() {
            wakeup.last_activity = Some(now);
        }

        false
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_active() {
            return None;
        }

        let state = self.state.borrow();
        let wakeup = state.wakeup.as_ref().and_then(|w| w.deadline);
        let command = state.queue.head().and_then(|h| h.deadline);

        match (wakeup, command) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire every timer that has expired.
    pub fn handle_timeout(&self) {
        if !self.is_active() {
            return;
        }

        let now = self.clock.now();

        let wakeup_expired = {
            let state = self.state.borrow();
            state
                .wakeup
                .as_ref()
                .and_then(|w| w.deadline)
                .is_some_and(|d| now >= d)
        };

        if wakeup_expired {
            self.wakeup_no_response(now);
        }

        if !self.is_active() {
            return;
        }

        let head_expired = {
            let state = self.state.borrow();
            state
                .queue
                .head()
                .and_then(|h| h.deadline)
                .is_some_and(|d| now >= d)
        };

        if head_expired {
            warn!(channel = %self.name, "command timed out");
            self.count(&metric_defs::COMMANDS_TIMED_OUT, 1);
            self.finish_command(false, None);
        }
    }

    /// The wakeup got no answer: fail the head and try again.
    fn wakeup_no_response(&self, now: Instant) {
        debug!(channel = %self.name, "wakeup got no response");
        self.count(&metric_defs::WAKEUP_TIMEOUTS, 1);

        let queued = {
            let mut state = self.state.borrow_mut();
            if let Some(wakeup) = state.wakeup.as_mut() {
                wakeup.deadline = None;
            }
            !state.queue.is_empty()
        };

        if !queued {
            return;
        }

        self.finish_command(false, None);

        if !self.is_active() {
            return;
        }

        let requeued = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;

            let head_is_wakeup = state.queue.head().is_some_and(|h| h.is_wakeup());
            match state.wakeup.as_mut() {
                Some(wakeup) if !state.queue.is_empty() && !head_is_wakeup => {
                    state.queue.push_front(PendingCommand::wakeup(&wakeup.command));
                    wakeup.deadline = Some(now + wakeup.response_timeout);
                    true
                }
                _ => false,
            }
        };

        if requeued {
            self.count(&metric_defs::WAKEUP_SENT, 1);
            self.arm_writer();
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_debug(&self, hook: Option<DebugFn>) {
        let old = std::mem::replace(&mut self.hooks.borrow_mut().debug, hook);
        drop(old);
    }

    pub fn set_disconnect(&self, hook: Option<DisconnectFn>) {
        let old = std::mem::replace(&mut self.hooks.borrow_mut().disconnect, hook);
        drop(old);
    }

    pub fn set_wakeup(&self, command: &str, response_timeout: Duration, inactivity: Duration) {
        let mut state = self.state.borrow_mut();
        let last_activity = state.wakeup.as_ref().and_then(|w| w.last_activity);

        state.wakeup = Some(WakeupState {
            command: command.to_string(),
            response_timeout,
            inactivity,
            last_activity,
            deadline: None,
        });
    }

    pub fn add_terminator(&self, rule: TerminatorRule) {
        self.state.borrow_mut().terminators.add(rule);
    }

    pub fn blacklist_terminator(&self, terminator: BuiltinTerminator) {
        self.state.borrow_mut().terminators.blacklist(terminator);
    }

    pub fn set_strip_sequence_tags(&self, enabled: bool) {
        self.state.borrow_mut().strip_sequence_tags = enabled;
    }

    pub fn set_max_read_attempts(&self, attempts: u32) {
        self.max_read_attempts.set(attempts.max(1));
    }

    fn debug_traffic(&self, direction: Direction, bytes: &[u8]) {
        let hook = self.hooks.borrow().debug.clone();
        if let Some(hook) = hook {
            hook(direction, bytes);
        }
    }

    // ========================================================================
    // Suspend / resume / disconnect
    // ========================================================================

    /// Stop reacting to the transport without losing state.
    pub fn suspend(&self) {
        self.suspended.set(true);
        self.write_armed.set(false);

        if let Some(transport) = self.transport.borrow_mut().as_mut() {
            transport.set_write_interest(false);
            transport.set_read_interest(false);
        }
    }

    /// Reattach to the transport, or run the disconnect path if it closed
    /// meanwhile.
    pub fn resume(&self) {
        if !self.is_active() {
            return;
        }

        self.suspended.set(false);

        let open = self
            .transport
            .borrow()
            .as_ref()
            .is_some_and(|t| t.is_open());

        if !open {
            self.on_hangup();
            return;
        }

        if let Some(transport) = self.transport.borrow_mut().as_mut() {
            transport.set_read_interest(true);
        }

        if !self.state.borrow().queue.is_empty() {
            self.arm_writer();
        }

        if !self.in_read_handler.get() {
            self.process_buffer();
        }
    }

    /// The transport went away.
    pub fn on_hangup(&self) {
        if !self.is_active() {
            return;
        }

        debug!(channel = %self.name, "transport disconnected");
        self.lifecycle.set(Lifecycle::Disconnected);
        self.write_armed.set(false);

        let transport = self.transport.borrow_mut().take();
        let flushed = self.state.borrow_mut().cleanup();
        let hook = self.hooks.borrow_mut().disconnect.take();

        drop(transport);
        drop(flushed);

        if let Some(hook) = hook {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_sequence_tag() {
        let mut line = "U1234+CLIP: \"555\",129".to_string();
        strip_sequence_tag(&mut line);
        assert_eq!(line, "U0000+CLIP: \"555\",129");

        let mut short = "U12".to_string();
        strip_sequence_tag(&mut short);
        assert_eq!(short, "U12");

        let mut word = "UNKNOWN".to_string();
        strip_sequence_tag(&mut word);
        assert_eq!(word, "UNKNOWN");
    }

    fn state_with(bytes: &[u8]) -> EngineState {
        let mut buffer = RingBuffer::with_capacity(16);
        buffer.append(bytes).unwrap();
        EngineState {
            read_so_far: bytes.len(),
            buffer,
            syntax: Box::new(crate::syntax::GsmV1Syntax::new()),
            queue: CommandQueue::default(),
            notify: NotificationRegistry::default(),
            terminators: TerminatorSet::new(),
            pdu_header: None,
            response_lines: Vec::new(),
            wakeup: None,
            next_cmd_id: 1,
            next_notify_id: 1,
            strip_sequence_tags: false,
        }
    }

    #[test]
    fn test_extract_line_strips_framing() {
        let mut state = state_with(b"\r\n+CREG: 1\r\n");
        assert_eq!(state.extract_line().as_deref(), Some("+CREG: 1"));
        assert!(state.buffer.is_empty());
        assert_eq!(state.read_so_far, 0);
    }

    #[test]
    fn test_extract_line_keeps_quoted_cr() {
        let mut state = state_with(b"+X: \"a\rb\"\r\n");
        assert_eq!(state.extract_line().as_deref(), Some("+X: \"a\rb\""));
    }

    #[test]
    fn test_extract_line_only_framed_bytes() {
        let mut state = state_with(b"OK\r\nRING\r\n");
        state.read_so_far = 4;

        assert_eq!(state.extract_line().as_deref(), Some("OK"));
        assert_eq!(state.buffer.len(), 6);
    }

    #[test]
    fn test_extract_empty_line() {
        let mut state = state_with(b"\r\n");
        assert_eq!(state.extract_line(), None);
        assert!(state.buffer.is_empty());
    }

    #[test]
    fn test_command_ids_skip_wakeup_id() {
        let mut state = state_with(b"");
        state.next_cmd_id = u32::MAX;

        assert_eq!(state.allocate_cmd_id(), CommandId(u32::MAX));
        assert_eq!(state.allocate_cmd_id(), CommandId(1));
    }
}
