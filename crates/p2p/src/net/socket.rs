//! A buffered wrapper around a raw connection, tracking link direction and queuing writes
//! until the underlying stream is ready.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use crate::net::Link;

/// A registered peer connection. Owns the raw stream plus an outbound write queue, since the
/// reactor only flushes on a `WRITE`-interest readiness event rather than blocking on write.
pub struct Socket<R: Write + Read> {
    raw: R,
    address: SocketAddr,
    pub link: Link,
    outbound: VecDeque<u8>,
}

impl<R: Write + Read> Socket<R> {
    pub fn from(raw: R, address: SocketAddr, link: Link) -> Self {
        Self {
            raw,
            address,
            link,
            outbound: VecDeque::new(),
        }
    }

    /// Queue bytes to be written on the next flush.
    pub fn push(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes);
    }

    /// Write as much of the queued bytes as the stream accepts without blocking.
    ///
    /// Returns `Ok(())` once the queue is fully drained. A `WouldBlock`/`WriteZero` error
    /// leaves the remainder queued for the next call; any other error is propagated.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            let (head, _) = self.outbound.as_slices();
            match self.raw.write(head) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read bytes off the underlying stream into `buf`, same contract as `Read::read`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }

    /// The local address of the underlying connection.
    pub fn local_address(&self) -> io::Result<SocketAddr>
    where
        R: LocalAddr,
    {
        self.raw.local_addr()
    }

    /// The remote address this socket is connected to.
    pub fn remote_address(&self) -> SocketAddr {
        self.address
    }
}

/// Abstracts `TcpStream::local_addr` so `Socket` stays generic over the stream type used in
/// tests (an in-memory duplex pipe has no real local address).
pub trait LocalAddr {
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl LocalAddr for std::net::TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpStream::local_addr(self)
    }
}

impl<R: Write + Read> Socket<R> {
    /// Shut down the underlying connection, if it supports it.
    pub fn disconnect(&self) -> io::Result<()>
    where
        R: Shutdown,
    {
        self.raw.shutdown()
    }
}

/// Abstracts `TcpStream::shutdown`.
pub trait Shutdown {
    fn shutdown(&self) -> io::Result<()>;
}

impl Shutdown for std::net::TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        std::net::TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct InMemory {
        write_buf: Vec<u8>,
        read_buf: Cursor<Vec<u8>>,
    }

    impl Write for InMemory {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for InMemory {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.read_buf.read(buf)
        }
    }

    #[test]
    fn push_then_flush_writes_all_queued_bytes() {
        let raw = InMemory {
            write_buf: Vec::new(),
            read_buf: Cursor::new(Vec::new()),
        };
        let mut socket = Socket::from(raw, "127.0.0.1:1".parse().unwrap(), Link::Outbound);
        socket.push(b"hello");
        socket.push(b" world");
        socket.flush().unwrap();
        assert_eq!(socket.raw.write_buf, b"hello world");
    }

    #[test]
    fn read_delegates_to_underlying_stream() {
        let raw = InMemory {
            write_buf: Vec::new(),
            read_buf: Cursor::new(b"payload".to_vec()),
        };
        let mut socket = Socket::from(raw, "127.0.0.1:1".parse().unwrap(), Link::Inbound);
        let mut buf = [0u8; 7];
        let n = socket.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }
}
