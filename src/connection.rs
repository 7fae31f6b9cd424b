// Copyright 2020 Joyent, Inc.

use std::error;

/// The interface a connection must implement to participate in the pool.
///
/// A connection is normally a TCP socket
/// ([`SocketConn`](../socket/struct.SocketConn.html)), but anything with a
/// connect/probe/close lifecycle works; the pool tests drive dummies. The
/// associated `Error` type lets each implementation report failures in its
/// own vocabulary as long as the type implements
/// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) from the
/// standard library.
pub trait Connection: Send + Sized + 'static {
    type Error: error::Error;

    /// Attempt to establish the connection to the backend.
    fn connect(&mut self) -> Result<(), Self::Error>;

    /// Close the connection. Must be idempotent.
    fn close(&mut self) -> Result<(), Self::Error>;

    /// Whether the connection still appears open. The check is allowed to
    /// be optimistic: a `true` here may still be followed by an I/O failure
    /// on the next use, which demotes the connection to broken.
    fn is_alive(&self) -> bool;
}
