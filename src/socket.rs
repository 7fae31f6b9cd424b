// Copyright 2020 Joyent, Inc.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::backend::Backend;
use crate::connection::Connection;
use crate::error::Error;
use crate::protocol::Transport;

/// One framed, line-oriented TCP connection to one memcached server.
///
/// The stream is split into a buffered reader and a buffered writer so
/// small protocol writes coalesce and replies can be read a line at a
/// time. A `SocketConn` is constructed unconnected; the pool drives
/// `connect` through the [`Connection`](../connection/trait.Connection.html)
/// impl.
#[derive(Debug)]
pub struct SocketConn {
    backend: Backend,
    timeout: Option<Duration>,
    nagle: bool,
    reader: Option<BufReader<TcpStream>>,
    writer: Option<BufWriter<TcpStream>>,
}

fn closed() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "connection is closed",
    ))
}

impl SocketConn {
    /// Create an unconnected socket for `backend`. A zero `timeout_ms`
    /// means reads block indefinitely; `nagle == false` sets TCP_NODELAY
    /// once connected.
    pub fn new(backend: &Backend, timeout_ms: u64, nagle: bool) -> Self {
        let timeout = if timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms))
        };
        SocketConn {
            backend: backend.clone(),
            timeout,
            nagle,
            reader: None,
            writer: None,
        }
    }

    /// The server this socket points at.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    fn open(&mut self) -> Result<(), Error> {
        let stream =
            TcpStream::connect((self.backend.host.as_str(), self.backend.port))
                .map_err(|e| {
                    Error::Unreachable(format!("{}: {}", self.backend.name, e))
                })?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_nodelay(!self.nagle)?;
        let write_half = stream.try_clone()?;
        self.reader = Some(BufReader::new(stream));
        self.writer = Some(BufWriter::new(write_half));
        Ok(())
    }

    /// Write every byte of `buf` into the send buffer.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer.write_all(buf)?),
            None => Err(closed()),
        }
    }

    /// Empty the send buffer onto the wire.
    pub fn flush(&mut self) -> Result<(), Error> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer.flush()?),
            None => Err(closed()),
        }
    }

    /// Read through the next `\r\n`. Both delimiter bytes are consumed and
    /// the preceding bytes are returned.
    pub fn read_line(&mut self) -> Result<String, Error> {
        let reader = self.reader.as_mut().ok_or_else(closed)?;
        let mut buf = Vec::new();
        reader.read_until(b'\n', &mut buf)?;
        if !buf.ends_with(b"\r\n") {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before line terminator",
            )));
        }
        buf.truncate(buf.len() - 2);
        String::from_utf8(buf)
            .map_err(|_| Error::Protocol("reply line is not UTF-8".to_string()))
    }

    /// Read exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        let reader = self.reader.as_mut().ok_or_else(closed)?;
        let mut buf = vec![0u8; n];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read and discard through the next `\r\n`.
    pub fn consume_eol(&mut self) -> Result<(), Error> {
        let reader = self.reader.as_mut().ok_or_else(closed)?;
        let mut buf = Vec::new();
        reader.read_until(b'\n', &mut buf)?;
        if buf.ends_with(b"\r\n") {
            Ok(())
        } else {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before line terminator",
            )))
        }
    }

    // OS-level readiness peek. `WouldBlock` means the socket is open with
    // nothing pending; a zero-byte read means the peer closed. The answer
    // can be stale for a half-closed peer; the next I/O surfaces that.
    fn probe(&self) -> bool {
        let stream = match self.reader.as_ref() {
            Some(reader) => reader.get_ref(),
            None => return false,
        };
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let alive = match stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };
        if stream.set_nonblocking(false).is_err() {
            return false;
        }
        alive
    }

    /// Close writer, reader, and socket. Idempotent; errors are aggregated
    /// into a single `Io` but the connection is unusable regardless of the
    /// result.
    pub fn hard_close(&mut self) -> Result<(), Error> {
        let mut first_err: Option<io::Error> = None;
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                first_err.get_or_insert(e);
            }
        }
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.get_ref().shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(Error::Io(e)),
            None => Ok(()),
        }
    }
}

impl Connection for SocketConn {
    type Error = Error;

    fn connect(&mut self) -> Result<(), Error> {
        self.open()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.hard_close()
    }

    fn is_alive(&self) -> bool {
        self.probe()
    }
}

impl Transport for SocketConn {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        SocketConn::write_all(self, buf)
    }

    fn flush(&mut self) -> Result<(), Error> {
        SocketConn::flush(self)
    }

    fn read_line(&mut self) -> Result<String, Error> {
        SocketConn::read_line(self)
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        SocketConn::read_exact(self, n)
    }

    fn consume_eol(&mut self) -> Result<(), Error> {
        SocketConn::consume_eol(self)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn loopback_pair() -> (SocketConn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let backend = Backend::parse(&addr.to_string()).unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let mut conn = SocketConn::new(&backend, 2000, true);
        conn.connect().unwrap();
        (conn, accept.join().unwrap())
    }

    #[test]
    fn read_line_strips_both_delimiter_bytes() {
        let (mut conn, mut peer) = loopback_pair();
        peer.write_all(b"STORED\r\nEND\r\n").unwrap();
        assert_eq!(conn.read_line().unwrap(), "STORED");
        assert_eq!(conn.read_line().unwrap(), "END");
    }

    #[test]
    fn read_line_fails_on_eof_before_delimiter() {
        let (mut conn, mut peer) = loopback_pair();
        peer.write_all(b"PARTIAL").unwrap();
        drop(peer);
        assert!(matches!(conn.read_line(), Err(Error::Io(_))));
    }

    #[test]
    fn read_exact_then_consume_eol() {
        let (mut conn, mut peer) = loopback_pair();
        peer.write_all(b"abcde\r\n").unwrap();
        assert_eq!(conn.read_exact(5).unwrap(), b"abcde");
        conn.consume_eol().unwrap();
    }

    #[test]
    fn probe_sees_peer_close() {
        let (conn, peer) = loopback_pair();
        assert!(conn.is_alive());
        drop(peer);
        // Give the stack a moment to deliver the FIN.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!conn.is_alive());
    }

    #[test]
    fn hard_close_is_idempotent() {
        let (mut conn, _peer) = loopback_pair();
        conn.hard_close().unwrap();
        conn.hard_close().unwrap();
        assert!(!conn.is_alive());
        assert!(conn.write_all(b"x").is_err());
    }

    #[test]
    fn connect_to_refused_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let backend = Backend::parse(&addr.to_string()).unwrap();
        let mut conn = SocketConn::new(&backend, 1000, true);
        assert!(matches!(conn.connect(), Err(Error::Unreachable(_))));
    }
}
