//! TCP Transport Module
//!
//! Runs a chat channel over a TCP connection, typically a serial-to-TCP
//! bridge in front of a modem. The engine sees a non-blocking [`Transport`];
//! the session loop holds the paired [`TcpLink`] and awaits readiness on
//! whatever the engine currently asks for.

use std::cell::Cell;
use std::io;
use std::rc::Rc;

use atchat::Transport;
use tokio::net::TcpStream;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug)]
struct Shared {
    stream: TcpStream,
    read_interest: Cell<bool>,
    write_interest: Cell<bool>,
    open: Cell<bool>,
}

/// The engine's side of a TCP connection.
#[derive(Debug)]
pub struct TcpTransport {
    shared: Rc<Shared>,
}

/// The host's side of a TCP connection: readiness and interest.
#[derive(Debug, Clone)]
pub struct TcpLink {
    shared: Rc<Shared>,
}

impl TcpTransport {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> (TcpTransport, TcpLink) {
        let shared = Rc::new(Shared {
            stream,
            read_interest: Cell::new(false),
            write_interest: Cell::new(false),
            open: Cell::new(true),
        });

        (
            TcpTransport {
                shared: Rc::clone(&shared),
            },
            TcpLink { shared },
        )
    }

    fn closed_on(&self, result: io::Result<usize>) -> io::Result<usize> {
        match &result {
            Ok(0) => self.shared.open.set(false),
            Err(err) if err.kind() != io::ErrorKind::WouldBlock
                && err.kind() != io::ErrorKind::Interrupted =>
            {
                self.shared.open.set(false)
            }
            _ => {}
        }
        result
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.shared.open.get() {
            return Ok(0);
        }
        let result = self.shared.stream.try_read(buf);
        self.closed_on(result)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.shared.open.get() {
            return Ok(0);
        }
        let result = self.shared.stream.try_write(data);
        self.closed_on(result)
    }

    fn set_read_interest(&mut self, enabled: bool) {
        self.shared.read_interest.set(enabled);
    }

    fn set_write_interest(&mut self, enabled: bool) {
        self.shared.write_interest.set(enabled);
    }

    fn is_open(&self) -> bool {
        self.shared.open.get()
    }
}

impl TcpLink {
    /// Wait until the socket may be readable.
    pub async fn readable(&self) -> io::Result<()> {
        self.shared.stream.readable().await
    }

    /// Wait until the socket may be writable.
    pub async fn writable(&self) -> io::Result<()> {
        self.shared.stream.writable().await
    }

    pub fn read_interest(&self) -> bool {
        self.shared.read_interest.get()
    }

    pub fn write_interest(&self) -> bool {
        self.shared.write_interest.get()
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.get()
    }

    /// Peer address, for logging.
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.shared.stream.peer_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpTransport, TcpLink, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (transport, link) = TcpTransport::new(client);
        (transport, link, server)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (mut transport, link, mut modem) = pair().await;

        link.writable().await.unwrap();
        assert_eq!(transport.write(b"AT\r").unwrap(), 3);

        let mut buf = [0u8; 3];
        modem.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AT\r");

        modem.write_all(b"\r\nOK\r\n").await.unwrap();
        let mut received = Vec::new();
        while received.len() < 6 {
            link.readable().await.unwrap();
            let mut chunk = [0u8; 16];
            match transport.read(&mut chunk) {
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("read failed: {err}"),
            }
        }
        assert_eq!(received, b"\r\nOK\r\n");
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_interest_flags_visible_to_link() {
        let (mut transport, link, _modem) = pair().await;

        assert!(!link.read_interest());
        transport.set_read_interest(true);
        transport.set_write_interest(true);
        assert!(link.read_interest());
        assert!(link.write_interest());
        transport.set_write_interest(false);
        assert!(!link.write_interest());
    }

    #[tokio::test]
    async fn test_peer_close_marks_closed() {
        let (mut transport, link, modem) = pair().await;
        drop(modem);

        let mut chunk = [0u8; 16];
        loop {
            link.readable().await.unwrap();
            match transport.read(&mut chunk) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => break,
            }
        }
        assert!(!transport.is_open());
        assert!(!link.is_open());
    }
}
