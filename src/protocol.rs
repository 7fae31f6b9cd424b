// Copyright 2020 Joyent, Inc.

//! The memcached text-protocol engine.
//!
//! One method per command family, each a strictly serial write-then-read
//! exchange: the command (and payload, for storage) is written and flushed,
//! then the reply lines are parsed. Commands never pipeline on a single
//! connection. Any I/O failure obliges the caller to invalidate the lease
//! so the broken connection never rejoins the pool.

use std::collections::HashMap;

use slog::{trace, Logger};

use crate::codec::{self, Value};
use crate::error::Error;

// Longest key the text protocol accepts.
const MAX_KEY_LEN: usize = 250;

/// The I/O surface the protocol engine drives.
/// [`SocketConn`](../socket/struct.SocketConn.html) is the real
/// implementation; the unit tests script one in memory.
pub trait Transport {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error>;
    fn flush(&mut self) -> Result<(), Error>;
    fn read_line(&mut self) -> Result<String, Error>;
    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, Error>;
    fn consume_eol(&mut self) -> Result<(), Error>;
}

/// The storage command family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreCommand {
    /// Store unconditionally.
    Set,
    /// Store only when the key is absent.
    Add,
    /// Store only when the key is present.
    Replace,
}

impl StoreCommand {
    fn verb(self) -> &'static str {
        match self {
            StoreCommand::Set => "set",
            StoreCommand::Add => "add",
            StoreCommand::Replace => "replace",
        }
    }
}

/// The counter mutation family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutateCommand {
    Incr,
    Decr,
}

impl MutateCommand {
    fn verb(self) -> &'static str {
        match self {
            MutateCommand::Incr => "incr",
            MutateCommand::Decr => "decr",
        }
    }
}

/// Formats commands, parses replies, and drives a transport one exchange
/// at a time.
#[derive(Clone)]
pub struct Protocol {
    compress_enable: bool,
    compress_threshold: usize,
    log: Logger,
}

impl Protocol {
    pub fn new(
        compress_enable: bool,
        compress_threshold: usize,
        log: Logger,
    ) -> Self {
        Protocol {
            compress_enable,
            compress_threshold,
            log,
        }
    }

    /// `set`/`add`/`replace`. `Ok(true)` on STORED, `Ok(false)` on
    /// NOT_STORED. `expiry` is 0 (never expire) or a Unix epoch in seconds.
    pub fn store<T: Transport>(
        &self,
        conn: &mut T,
        command: StoreCommand,
        key: &str,
        value: &Value,
        expiry: i64,
    ) -> Result<bool, Error> {
        check_key(key)?;
        let (payload, flags) =
            codec::encode(value, self.compress_enable, self.compress_threshold)?;
        trace!(
            self.log,
            "-> {} {} flags {} ({} bytes)",
            command.verb(),
            key,
            flags,
            payload.len()
        );
        let header = format!(
            "{} {} {} {} {}\n",
            command.verb(),
            key,
            flags,
            expiry,
            payload.len()
        );
        conn.write_all(header.as_bytes())?;
        conn.write_all(&payload)?;
        conn.write_all(b"\n")?;
        conn.flush()?;

        let line = conn.read_line()?;
        match line.as_str() {
            "STORED" => Ok(true),
            "NOT_STORED" => Ok(false),
            other => Err(Error::Protocol(format!(
                "unexpected reply to {}: {:?}",
                command.verb(),
                other
            ))),
        }
    }

    /// Single-key `get`.
    pub fn retrieve<T: Transport>(
        &self,
        conn: &mut T,
        key: &str,
    ) -> Result<Option<Value>, Error> {
        check_key(key)?;
        let mut found = self.issue_get(conn, &[key])?;
        Ok(found.remove(key))
    }

    /// Multi-key `get` on one connection. Missing keys are simply absent
    /// from the result.
    pub fn retrieve_multi<T: Transport>(
        &self,
        conn: &mut T,
        keys: &[&str],
    ) -> Result<HashMap<String, Value>, Error> {
        for key in keys {
            check_key(key)?;
        }
        self.issue_get(conn, keys)
    }

    fn issue_get<T: Transport>(
        &self,
        conn: &mut T,
        keys: &[&str],
    ) -> Result<HashMap<String, Value>, Error> {
        let mut command = String::from("get");
        for key in keys {
            command.push(' ');
            command.push_str(key);
        }
        command.push('\n');
        conn.write_all(command.as_bytes())?;
        conn.flush()?;

        // Zero or more VALUE blocks, then END.
        let mut values = HashMap::new();
        loop {
            let line = conn.read_line()?;
            if line == "END" {
                break;
            }
            let (key, flags, len) = parse_value_header(&line)?;
            let payload = conn.read_exact(len)?;
            conn.consume_eol()?;
            trace!(self.log, "<- VALUE {} flags {} ({} bytes)", key, flags, len);
            values.insert(key, codec::decode(payload, flags)?);
        }
        Ok(values)
    }

    /// `delete`. `Ok(true)` on DELETED, `Ok(false)` on NOT_FOUND.
    pub fn delete<T: Transport>(
        &self,
        conn: &mut T,
        key: &str,
        expiry: Option<i64>,
    ) -> Result<bool, Error> {
        check_key(key)?;
        let command = match expiry {
            Some(at) => format!("delete {} {}\n", key, at),
            None => format!("delete {}\n", key),
        };
        conn.write_all(command.as_bytes())?;
        conn.flush()?;

        let line = conn.read_line()?;
        match line.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(Error::Protocol(format!(
                "unexpected reply to delete: {:?}",
                other
            ))),
        }
    }

    /// `incr`/`decr`. `Ok(None)` when the counter does not exist, otherwise
    /// the server's new value. The server counter is unsigned and clamps
    /// underflow to zero.
    pub fn mutate<T: Transport>(
        &self,
        conn: &mut T,
        command: MutateCommand,
        key: &str,
        quantity: u64,
    ) -> Result<Option<u64>, Error> {
        check_key(key)?;
        let line = format!("{} {} {}\n", command.verb(), key, quantity);
        conn.write_all(line.as_bytes())?;
        conn.flush()?;

        let reply = conn.read_line()?;
        if reply == "NOT_FOUND" {
            return Ok(None);
        }
        if !is_decimal(&reply) {
            return Err(Error::Protocol(format!(
                "unexpected reply to {}: {:?}",
                command.verb(),
                reply
            )));
        }
        // A negative reply would mean a nonconforming peer; clamp it to the
        // counter's documented floor.
        if reply.starts_with('-') {
            return Ok(Some(0));
        }
        let value = reply.parse::<u64>().map_err(|_| {
            Error::Protocol(format!("counter reply out of range: {:?}", reply))
        })?;
        Ok(Some(value))
    }

    /// `stats`: the server's STAT lines as a name -> value map.
    pub fn stats<T: Transport>(
        &self,
        conn: &mut T,
    ) -> Result<HashMap<String, String>, Error> {
        conn.write_all(b"stats\n")?;
        conn.flush()?;

        let mut stats = HashMap::new();
        loop {
            let line = conn.read_line()?;
            if line == "END" {
                break;
            }
            let mut parts = line.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("STAT"), Some(name), Some(value)) => {
                    stats.insert(name.to_string(), value.to_string());
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "malformed STAT line: {:?}",
                        line
                    )));
                }
            }
        }
        Ok(stats)
    }

    /// `flush_all`.
    pub fn flush_all<T: Transport>(&self, conn: &mut T) -> Result<(), Error> {
        conn.write_all(b"flush_all\n")?;
        conn.flush()?;

        let line = conn.read_line()?;
        if line == "OK" {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "unexpected reply to flush_all: {:?}",
                line
            )))
        }
    }
}

/// Keys travel on the command line unescaped: nonempty, at most 250 bytes,
/// no whitespace or control bytes.
pub fn check_key(key: &str) -> Result<(), Error> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::BadKey(key.to_string()));
    }
    if key.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(Error::BadKey(key.to_string()));
    }
    Ok(())
}

// `VALUE <key> <flags> <bytes>`
fn parse_value_header(line: &str) -> Result<(String, u32, usize), Error> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some("VALUE"), Some(key), Some(flags), Some(len), None) => {
            let flags = flags
                .parse::<u32>()
                .map_err(|_| bad_value_line(line))?;
            let len = len.parse::<usize>().map_err(|_| bad_value_line(line))?;
            Ok((key.to_string(), flags, len))
        }
        _ => Err(bad_value_line(line)),
    }
}

fn bad_value_line(line: &str) -> Error {
    Error::Protocol(format!("malformed VALUE line: {:?}", line))
}

// Decimal digits with an optional leading minus.
fn is_decimal(line: &str) -> bool {
    let digits = line.strip_prefix('-').unwrap_or(line);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
