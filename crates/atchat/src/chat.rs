//! Group handles onto a shared chat engine.
//!
//! A [`Chat`] is what feature drivers hold. Every clone shares the engine but
//! gets its own group, so a driver can cancel or unregister only its own work.
//! Dropping the last `Chat` tears the engine down.
//!
//! A [`ChatIo`] is what the host event loop holds. It forwards readiness and
//! timer events to the engine but does not keep the channel alive, so a
//! callback that drops the last `Chat` mid-dispatch tears the channel down
//! while the read loop is still on the stack.
//!
//! ```
//! use atchat::{Chat, GsmV1Syntax, MemoryTransport};
//!
//! let (transport, modem) = MemoryTransport::new();
//! let chat = Chat::open(Box::new(transport), Box::new(GsmV1Syntax::new()));
//!
//! chat.send("AT+CSQ", Some(&["+CSQ:"]), |ok, result| {
//!     assert!(ok);
//!     assert_eq!(result.lines(), ["+CSQ: 20,99"]);
//! })
//! .unwrap();
//!
//! chat.on_writable();
//! assert_eq!(modem.take_written(), b"AT+CSQ\r");
//!
//! modem.inject(b"\r\n+CSQ: 20,99\r\n\r\nOK\r\n");
//! chat.on_readable();
//! ```

use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::command::{CommandId, CommandRequest, GroupId, Release};
use crate::config::ChatConfig;
use crate::engine::{ChatEngine, Lifecycle};
use crate::error::{ChatError, ChatResult};
use crate::notify::NotifyId;
use crate::result::AtResult;
use crate::syntax::Syntax;
use crate::terminator::{BuiltinTerminator, TerminatorMatch, TerminatorRule};
use crate::transport::{Direction, Transport};

/// Name used when a channel is opened without a configuration.
pub const DEFAULT_CHANNEL_NAME: &str = "modem";

fn request(command: &str, prefixes: Option<&[&str]>) -> CommandRequest {
    let request = CommandRequest::new(command);
    match prefixes {
        Some(prefixes) => request.prefixes(prefixes.iter().copied()),
        None => request,
    }
}

// ============================================================================
// Chat
// ============================================================================

/// A group-scoped handle to a chat channel.
pub struct Chat {
    engine: Rc<ChatEngine>,
    group: GroupId,
    slave: Option<Box<Chat>>,
}

impl Chat {
    /// Open a channel over `transport` using the wall clock.
    pub fn open(transport: Box<dyn Transport>, syntax: Box<dyn Syntax>) -> Chat {
        Self::open_with_clock(transport, syntax, Rc::new(SystemClock))
    }

    pub fn open_with_clock(
        transport: Box<dyn Transport>,
        syntax: Box<dyn Syntax>,
        clock: Rc<dyn Clock>,
    ) -> Chat {
        Chat {
            engine: ChatEngine::new(DEFAULT_CHANNEL_NAME, transport, syntax, clock),
            group: GroupId::PRIMARY,
            slave: None,
        }
    }

    /// Open a channel and apply `config` to it.
    pub fn from_config(transport: Box<dyn Transport>, config: &ChatConfig) -> ChatResult<Chat> {
        Self::from_config_with_clock(transport, config, Rc::new(SystemClock))
    }

    pub fn from_config_with_clock(
        transport: Box<dyn Transport>,
        config: &ChatConfig,
        clock: Rc<dyn Clock>,
    ) -> ChatResult<Chat> {
        let chat = Chat {
            engine: ChatEngine::new(&config.name, transport, config.syntax.build(), clock),
            group: GroupId::PRIMARY,
            slave: None,
        };

        if let Some(wakeup) = &config.wakeup {
            chat.set_wakeup_command(&wakeup.command, wakeup.response_timeout(), wakeup.inactivity())?;
        }
        for terminator in &config.terminators {
            chat.engine.add_terminator(terminator.to_rule());
        }
        for &builtin in &config.blacklist {
            chat.blacklist_terminator(builtin)?;
        }

        chat.engine.set_strip_sequence_tags(config.strip_sequence_tags);
        chat.engine.set_max_read_attempts(config.max_read_attempts);

        Ok(chat)
    }

    /// The group this handle acts for.
    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn is_primary(&self) -> bool {
        self.group == GroupId::PRIMARY
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// Host-side handle for driving I/O and timers.
    pub fn io(&self) -> ChatIo {
        ChatIo {
            engine: self.engine.clone(),
        }
    }

    fn ensure_primary(&self) -> ChatResult<()> {
        if self.engine.lifecycle() != Lifecycle::Active {
            return Err(ChatError::Closed);
        }
        if !self.is_primary() {
            return Err(ChatError::NotPrimaryGroup);
        }
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Queue a command.
    ///
    /// With `prefixes` only matching lines are collected into the result;
    /// without, every non-terminator line after the command is.
    pub fn send(
        &self,
        command: &str,
        prefixes: Option<&[&str]>,
        on_complete: impl FnOnce(bool, &AtResult) + 'static,
    ) -> ChatResult<CommandId> {
        self.submit(request(command, prefixes).on_complete(on_complete))
    }

    /// Queue a command whose response lines go to `listing` one by one.
    pub fn send_listing(
        &self,
        command: &str,
        prefixes: &[&str],
        listing: impl FnMut(&AtResult) + 'static,
        on_complete: impl FnOnce(bool, &AtResult) + 'static,
    ) -> ChatResult<CommandId> {
        self.submit(
            request(command, Some(prefixes))
                .listing(listing)
                .on_complete(on_complete),
        )
    }

    /// Like [`send_listing`](Self::send_listing), but each response line is a
    /// header followed by a PDU, and `listing` gets them as one pair.
    pub fn send_pdu_listing(
        &self,
        command: &str,
        prefixes: &[&str],
        listing: impl FnMut(&AtResult) + 'static,
        on_complete: impl FnOnce(bool, &AtResult) + 'static,
    ) -> ChatResult<CommandId> {
        self.submit(
            request(command, Some(prefixes))
                .expect_pdu()
                .listing(listing)
                .on_complete(on_complete),
        )
    }

    /// Queue a prompt-driven command for a modem that answers the embedded
    /// `\r` with a short prompt.
    pub fn send_and_expect_short_prompt(
        &self,
        command: &str,
        prefixes: Option<&[&str]>,
        on_complete: impl FnOnce(bool, &AtResult) + 'static,
    ) -> ChatResult<CommandId> {
        self.submit(
            request(command, prefixes)
                .expect_short_prompt()
                .on_complete(on_complete),
        )
    }

    /// Queue a fully described command.
    pub fn submit(&self, request: CommandRequest) -> ChatResult<CommandId> {
        self.engine.submit(self.group, request)
    }

    /// Cancel one of this group's commands. A command already being written
    /// stays queued but its callbacks are dropped.
    pub fn cancel(&self, id: CommandId) -> bool {
        self.engine.cancel(self.group, id)
    }

    /// Cancel every command of this group.
    pub fn cancel_all(&self) -> bool {
        self.engine.cancel_group(self.group)
    }

    /// Whether this group's command `id` is still queued and not canceled.
    pub fn is_pending(&self, id: CommandId) -> bool {
        self.engine.is_pending(self.group, id)
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Call `callback` for every unsolicited line starting with `prefix`.
    ///
    /// With `expect_pdu` the line is a header and the callback gets it
    /// together with the PDU line that follows. All registrations of one
    /// prefix must agree on `expect_pdu`.
    pub fn register(
        &self,
        prefix: &str,
        expect_pdu: bool,
        callback: impl FnMut(&AtResult) + 'static,
    ) -> ChatResult<NotifyId> {
        self.engine
            .register(self.group, prefix, expect_pdu, Box::new(callback), None)
    }

    /// Like [`register`](Self::register), with a hook run once when the
    /// registration goes away.
    pub fn register_with_release(
        &self,
        prefix: &str,
        expect_pdu: bool,
        callback: impl FnMut(&AtResult) + 'static,
        on_release: impl FnOnce(Release) + 'static,
    ) -> ChatResult<NotifyId> {
        self.engine.register(
            self.group,
            prefix,
            expect_pdu,
            Box::new(callback),
            Some(Box::new(on_release)),
        )
    }

    pub fn unregister(&self, id: NotifyId) -> bool {
        self.engine.unregister(self.group, id)
    }

    pub fn unregister_all(&self) -> bool {
        self.engine.unregister_all(self.group)
    }

    // ========================================================================
    // Slave
    // ========================================================================

    /// Attach a handle that lives and is cloned along with this one.
    pub fn set_slave(&mut self, slave: Option<Chat>) {
        let old = std::mem::replace(&mut self.slave, slave.map(Box::new));
        drop(old);
    }

    pub fn slave(&self) -> Option<&Chat> {
        self.slave.as_deref()
    }

    // ========================================================================
    // Channel settings (primary handle only)
    // ========================================================================

    /// Report raw traffic to `hook`.
    pub fn set_debug(&self, hook: impl Fn(Direction, &[u8]) + 'static) -> ChatResult<()> {
        self.ensure_primary()?;
        self.engine.set_debug(Some(Rc::new(hook)));
        Ok(())
    }

    pub fn clear_debug(&self) -> ChatResult<()> {
        self.ensure_primary()?;
        self.engine.set_debug(None);
        Ok(())
    }

    /// Run `hook` once when the transport goes away.
    pub fn set_disconnect_function(&self, hook: impl FnOnce() + 'static) -> ChatResult<()> {
        self.ensure_primary()?;
        self.engine.set_disconnect(Some(Box::new(hook)));
        Ok(())
    }

    /// Probe the modem with `command` (written verbatim) before a command
    /// when the channel has been idle longer than `inactivity`.
    pub fn set_wakeup_command(
        &self,
        command: &str,
        response_timeout: Duration,
        inactivity: Duration,
    ) -> ChatResult<()> {
        self.ensure_primary()?;
        self.engine.set_wakeup(command, response_timeout, inactivity);
        Ok(())
    }

    /// Treat lines matching `pattern` as terminators. `match_len` compares
    /// only that many leading bytes; `None` requires the whole line.
    pub fn add_terminator(&self, pattern: &str, match_len: Option<usize>, success: bool) -> ChatResult<()> {
        self.ensure_primary()?;
        self.engine.add_terminator(TerminatorRule::new(
            pattern,
            TerminatorMatch::from_len(match_len),
            success,
        ));
        Ok(())
    }

    /// Stop treating a built-in result code as a terminator.
    pub fn blacklist_terminator(&self, terminator: BuiltinTerminator) -> ChatResult<()> {
        self.ensure_primary()?;
        self.engine.blacklist_terminator(terminator);
        Ok(())
    }

    pub fn set_strip_sequence_tags(&self, enabled: bool) -> ChatResult<()> {
        self.ensure_primary()?;
        self.engine.set_strip_sequence_tags(enabled);
        Ok(())
    }

    // ========================================================================
    // Suspend / resume and host delegation
    // ========================================================================

    /// Detach from the transport without losing any state.
    pub fn suspend(&self) {
        self.engine.suspend();
    }

    /// Reattach to the transport. If it closed in the meantime the
    /// disconnect path runs instead.
    pub fn resume(&self) {
        self.engine.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.engine.is_suspended()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.engine.lifecycle()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.lifecycle() == Lifecycle::Active
    }

    pub fn on_readable(&self) {
        self.engine.on_readable();
    }

    pub fn receive(&self, bytes: &[u8]) {
        self.engine.receive(bytes);
    }

    pub fn on_writable(&self) {
        self.engine.on_writable();
    }

    pub fn on_hangup(&self) {
        self.engine.on_hangup();
    }

    pub fn wants_write(&self) -> bool {
        self.engine.wants_write()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.engine.next_deadline()
    }

    pub fn handle_timeout(&self) {
        self.engine.handle_timeout();
    }
}

impl Clone for Chat {
    /// A new handle on the same channel with a fresh group. The slave, if
    /// any, is cloned too.
    fn clone(&self) -> Self {
        Chat {
            engine: self.engine.clone(),
            group: self.engine.acquire_group(),
            slave: self.slave.as_ref().map(|slave| Box::new(Chat::clone(slave))),
        }
    }
}

impl Drop for Chat {
    fn drop(&mut self) {
        drop(self.slave.take());
        self.engine.release_group(self.group);
    }
}

impl fmt::Debug for Chat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chat")
            .field("channel", &self.engine.name())
            .field("group", &self.group)
            .field("lifecycle", &self.engine.lifecycle())
            .field("slave", &self.slave)
            .finish()
    }
}

// ============================================================================
// ChatIo
// ============================================================================

/// Host-side handle: forwards transport readiness and timer expiry.
///
/// Holding a `ChatIo` does not keep the channel open; once every [`Chat`] is
/// gone all calls are no-ops.
#[derive(Clone)]
pub struct ChatIo {
    engine: Rc<ChatEngine>,
}

impl ChatIo {
    /// The transport has data. Reads until it runs dry or the per-event read
    /// budget is spent.
    pub fn on_readable(&self) {
        self.engine.on_readable();
    }

    /// Feed bytes read by the host itself.
    pub fn receive(&self, bytes: &[u8]) {
        self.engine.receive(bytes);
    }

    /// The transport accepts writes.
    pub fn on_writable(&self) {
        self.engine.on_writable();
    }

    /// The transport is gone.
    pub fn on_hangup(&self) {
        self.engine.on_hangup();
    }

    /// Whether the engine has something to write.
    pub fn wants_write(&self) -> bool {
        self.engine.wants_write()
    }

    /// When [`handle_timeout`](Self::handle_timeout) should next be called.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.engine.next_deadline()
    }

    pub fn handle_timeout(&self) {
        self.engine.handle_timeout();
    }

    pub fn is_connected(&self) -> bool {
        self.engine.lifecycle() == Lifecycle::Active
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.engine.lifecycle()
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }
}

impl fmt::Debug for ChatIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatIo")
            .field("channel", &self.engine.name())
            .field("lifecycle", &self.engine.lifecycle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::GsmV1Syntax;
    use crate::transport::{MemoryTransport, MemoryTransportHandle};
    use std::cell::RefCell;

    fn open() -> (Chat, MemoryTransportHandle) {
        let (transport, modem) = MemoryTransport::new();
        (
            Chat::open(Box::new(transport), Box::new(GsmV1Syntax::new())),
            modem,
        )
    }

    #[test]
    fn test_clone_allocates_groups() {
        let (chat, _modem) = open();
        let a = chat.clone();
        let b = a.clone();

        assert_eq!(chat.group(), GroupId::PRIMARY);
        assert_eq!(a.group(), GroupId(1));
        assert_eq!(b.group(), GroupId(2));
        assert!(chat.is_primary());
        assert!(!a.is_primary());
    }

    #[test]
    fn test_settings_need_primary() {
        let (chat, _modem) = open();
        let clone = chat.clone();

        assert_eq!(
            clone.add_terminator("+EXT", Some(4), true),
            Err(ChatError::NotPrimaryGroup)
        );
        assert_eq!(
            clone.blacklist_terminator(BuiltinTerminator::Ok),
            Err(ChatError::NotPrimaryGroup)
        );
        assert!(chat.add_terminator("+EXT", Some(4), true).is_ok());
    }

    #[test]
    fn test_slave_cloned_with_master() {
        let (mut chat, _modem) = open();
        let (other, _other_modem) = open();
        chat.set_slave(Some(other));

        let clone = chat.clone();
        assert_eq!(clone.slave().map(Chat::group), Some(GroupId(1)));
        assert_eq!(chat.slave().map(Chat::group), Some(GroupId::PRIMARY));
    }

    #[test]
    fn test_drop_last_handle_destroys() {
        let (chat, modem) = open();
        let io = chat.io();
        let released = Rc::new(RefCell::new(Vec::new()));
        let r = released.clone();

        let clone = chat.clone();
        clone
            .submit(CommandRequest::new("AT").on_release(move |why| r.borrow_mut().push(why)))
            .unwrap();
        drop(chat);

        assert!(io.is_connected());
        assert!(released.borrow().is_empty());

        drop(clone);
        assert_eq!(io.lifecycle(), Lifecycle::Destroyed);
        assert_eq!(*released.borrow(), vec![Release::Canceled]);
        assert!(!modem.read_interest());

        io.on_writable();
        assert!(modem.written().is_empty());
    }

    #[test]
    fn test_dropping_group_cancels_its_work() {
        let (chat, _modem) = open();
        let clone = chat.clone();
        let id = clone.send("AT+CSQ", None, |_, _| {}).unwrap();
        let keep = chat.send("AT+CREG?", None, |_, _| {}).unwrap();

        drop(clone);
        assert!(!chat.is_pending(id));
        assert!(chat.is_pending(keep));
    }

    #[test]
    fn test_closed_after_hangup() {
        let (chat, _modem) = open();
        chat.on_hangup();

        assert!(!chat.is_connected());
        assert_eq!(chat.send("AT", None, |_, _| {}), Err(ChatError::Closed));
        assert_eq!(chat.set_strip_sequence_tags(true), Err(ChatError::Closed));
    }
}
