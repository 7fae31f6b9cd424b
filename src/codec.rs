// Copyright 2020 Joyent, Inc.

//! Value serialization: bytes plus flag bits on the wire.
//!
//! Text and counter values travel as plain UTF-8 with no flags set and
//! interoperate with any memcached client. Binary values travel in a
//! one-byte-tagged form marked `F_SERIALIZED`, which round-trips only
//! through this client. Either form is gzip-wrapped and marked
//! `F_COMPRESSED` when it exceeds the configured threshold.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Error;

/// Flag bit: payload is gzip-compressed.
pub const F_COMPRESSED: u32 = 2;
/// Flag bit: payload is this client's self-describing serialization.
pub const F_SERIALIZED: u32 = 8;

/// Default byte threshold above which values are compressed.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 15_360;

// Tag byte leading the serialized form.
const TAG_BLOB: u8 = 0x01;

/// A value stored in or retrieved from memcached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// A UTF-8 string; stored as its bytes with no flags set.
    Text(String),
    /// A counter; stored as its ASCII decimal representation with no flags
    /// set so that server-side `incr`/`decr` works.
    Counter(u64),
    /// Arbitrary bytes; stored in the tagged serialized form.
    Blob(Vec<u8>),
}

impl Value {
    /// The text content, when this value is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Encode a value into wire bytes plus flag bits. When `compress` is set
/// and the encoding is strictly larger than `threshold` bytes, the payload
/// is gzip-wrapped and `F_COMPRESSED` is added.
pub fn encode(
    value: &Value,
    compress: bool,
    threshold: usize,
) -> Result<(Vec<u8>, u32), Error> {
    let (mut bytes, mut flags) = match value {
        Value::Text(text) => (text.as_bytes().to_vec(), 0),
        Value::Counter(n) => (n.to_string().into_bytes(), 0),
        Value::Blob(data) => {
            let mut framed = Vec::with_capacity(data.len() + 1);
            framed.push(TAG_BLOB);
            framed.extend_from_slice(data);
            (framed, F_SERIALIZED)
        }
    };

    if compress && bytes.len() > threshold {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes)?;
        bytes = encoder.finish()?;
        flags |= F_COMPRESSED;
    }

    Ok((bytes, flags))
}

/// Decode wire bytes according to their flag bits. Unknown bits are
/// tolerated; a flags-zero payload written by another client comes back as
/// `Text` when it is UTF-8 and `Blob` when it is not.
pub fn decode(mut bytes: Vec<u8>, flags: u32) -> Result<Value, Error> {
    if flags & F_COMPRESSED != 0 {
        let mut decoder = GzDecoder::new(&bytes[..]);
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain)?;
        bytes = plain;
    }

    if flags & F_SERIALIZED != 0 {
        return match bytes.split_first() {
            Some((&TAG_BLOB, rest)) => Ok(Value::Blob(rest.to_vec())),
            Some((tag, _)) => Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown serialization tag {:#04x}", tag),
            ))),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "empty serialized payload",
            ))),
        };
    }

    match String::from_utf8(bytes) {
        Ok(text) => Ok(Value::Text(text)),
        Err(not_utf8) => Ok(Value::Blob(not_utf8.into_bytes())),
    }
}
