// Copyright 2020 Joyent, Inc.

use std::error;
use std::fmt;
use std::io;

/// The error type for pool and protocol operations.
///
/// The soft server replies `NOT_FOUND` and `NOT_STORED` are not errors;
/// operations report them as `Ok(false)` or `Ok(None)`.
#[derive(Debug)]
pub enum Error {
    /// A socket, timeout, or framing failure. The connection that produced
    /// it is destroyed, never returned to the pool.
    Io(io::Error),
    /// No connection to the chosen server could be established, either
    /// because the host is inside its dead window or because every failover
    /// candidate was exhausted.
    Unreachable(String),
    /// The server reply did not match the expected grammar.
    Protocol(String),
    /// The pool has not been initialized, or has been shut down.
    NotInitialized,
    /// The configured server list was empty or unparseable.
    BadServerList(String),
    /// The key is empty, too long, or contains whitespace or control bytes.
    BadKey(String),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(io_err) => write!(fmt, "i/o error: {}", io_err),
            Error::Unreachable(what) => write!(fmt, "unreachable: {}", what),
            Error::Protocol(what) => write!(fmt, "protocol error: {}", what),
            Error::NotInitialized => write!(fmt, "pool is not initialized"),
            Error::BadServerList(what) => {
                write!(fmt, "bad server list: {}", what)
            }
            Error::BadKey(key) => write!(fmt, "bad key: {:?}", key),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(io_err) => Some(io_err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}
