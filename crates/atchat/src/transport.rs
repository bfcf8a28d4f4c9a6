//! Byte channel the engine runs over.
//!
//! The engine never blocks. Hosts watch the underlying device and call
//! `Chat::on_readable` / `Chat::on_writable` when it is ready; the engine
//! tells the host which readiness it cares about through the interest flags.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::rc::Rc;

/// Direction of traffic reported to the debug hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from the modem.
    Rx,
    /// Bytes written to the modem.
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "<"),
            Direction::Tx => write!(f, ">"),
        }
    }
}

/// A non-blocking byte source and sink.
pub trait Transport {
    /// Read available bytes. `Ok(0)` means the peer hung up;
    /// [`io::ErrorKind::WouldBlock`] means nothing is available right now.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `data` as the device accepts. `Ok(0)` means the
    /// device refuses further data; [`io::ErrorKind::WouldBlock`] means try
    /// again on the next writable event.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Whether the host should report readable events.
    fn set_read_interest(&mut self, enabled: bool);

    /// Whether the host should report writable events.
    fn set_write_interest(&mut self, enabled: bool);

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Debug)]
struct MemoryState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    write_chunk: Option<usize>,
    write_blocked: bool,
    read_interest: bool,
    write_interest: bool,
    open: bool,
}

/// Transport backed by in-process buffers.
///
/// The paired [`MemoryTransportHandle`] plays the modem: it injects inbound
/// bytes, inspects what was written and can throttle writes.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryState>>,
}

/// Modem side of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryTransportHandle {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> (MemoryTransport, MemoryTransportHandle) {
        let state = Rc::new(RefCell::new(MemoryState {
            inbound: VecDeque::new(),
            written: Vec::new(),
            write_chunk: None,
            write_blocked: false,
            read_interest: false,
            write_interest: false,
            open: true,
        }));

        (
            MemoryTransport {
                state: state.clone(),
            },
            MemoryTransportHandle { state },
        )
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();

        if state.inbound.is_empty() {
            return if state.open {
                Err(io::ErrorKind::WouldBlock.into())
            } else {
                Ok(0)
            };
        }

        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();

        if !state.open {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if state.write_blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = state.write_chunk.map_or(data.len(), |c| c.min(data.len()));
        state.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn set_read_interest(&mut self, enabled: bool) {
        self.state.borrow_mut().read_interest = enabled;
    }

    fn set_write_interest(&mut self, enabled: bool) {
        self.state.borrow_mut().write_interest = enabled;
    }

    fn is_open(&self) -> bool {
        self.state.borrow().open
    }
}

impl MemoryTransportHandle {
    /// Queue bytes for the engine to read.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.borrow_mut().inbound.extend(bytes);
    }

    /// Everything written so far, leaving it in place.
    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    /// Everything written so far, clearing the record.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().written)
    }

    /// Accept at most `chunk` bytes per write call.
    pub fn set_write_chunk(&self, chunk: Option<usize>) {
        self.state.borrow_mut().write_chunk = chunk;
    }

    /// Make writes fail with `WouldBlock`.
    pub fn set_write_blocked(&self, blocked: bool) {
        self.state.borrow_mut().write_blocked = blocked;
    }

    pub fn read_interest(&self) -> bool {
        self.state.borrow().read_interest
    }

    pub fn write_interest(&self) -> bool {
        self.state.borrow().write_interest
    }

    /// Hang up. Pending inbound bytes can still be read.
    pub fn close(&self) {
        self.state.borrow_mut().open = false;
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_inbound_then_would_block() {
        let (mut transport, handle) = MemoryTransport::new();
        handle.inject(b"OK\r\n");

        let mut buf = [0u8; 2];
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"OK");
        assert_eq!(transport.read(&mut buf).unwrap(), 2);

        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_closed_reads_eof_after_drain() {
        let (mut transport, handle) = MemoryTransport::new();
        handle.inject(b"x");
        handle.close();

        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf).unwrap(), 1);
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
        assert!(!transport.is_open());
        assert!(transport.write(b"AT\r").is_err());
    }

    #[test]
    fn test_write_chunking_and_blocking() {
        let (mut transport, handle) = MemoryTransport::new();
        handle.set_write_chunk(Some(2));

        assert_eq!(transport.write(b"AT\r").unwrap(), 2);
        handle.set_write_blocked(true);
        assert_eq!(
            transport.write(b"\r").unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(handle.take_written(), b"AT");
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_interest_flags() {
        let (mut transport, handle) = MemoryTransport::new();
        transport.set_write_interest(true);
        transport.set_read_interest(true);

        assert!(handle.write_interest());
        assert!(handle.read_interest());
        transport.set_write_interest(false);
        assert!(!handle.write_interest());
    }
}
