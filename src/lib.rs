// Copyright 2020 Joyent, Inc.

//! A pooled client for the memcached text protocol
//!
//! Snooker is a library for "playing pool" against a set of memcached
//! servers. An application stores, retrieves, mutates, and deletes opaque
//! values across one or more memcached daemons; snooker spreads keys over
//! the servers with a weighted hash-and-bucket scheme and multiplexes the
//! traffic over a pool of long-lived TCP connections.
//!
//! ## Key-to-server mapping
//!
//! At initialization the pool builds a *bucket vector*: an ordered sequence
//! of server addresses in which a server with weight `w` appears `w` times
//! consecutively. A key selects the bucket at `hash mod len`, where the hash
//! is one of three variants (see [`HashScheme`](hash/enum.HashScheme.html)):
//! the client's own string hash, an older `h*33 + byte` compatibility hash,
//! and the CRC32-based scheme that interoperates with other memcached
//! clients and is the default. When the selected server is unavailable and
//! failover is enabled, the key is rehashed and the walk continues on the
//! next bucket.
//!
//! ## Connection pooling
//!
//! Each server has an idle set and a busy set of connections. Acquiring a
//! connection probes an idle candidate before leasing it; candidates that
//! fail the probe are destroyed, never leased. On an idle miss the pool
//! opens a sliding window of new connections (doubling per miss, bounded),
//! banks all but one, and leases the last. Servers that refuse connections
//! enter an exponential-backoff dead window during which no connect is
//! attempted. A background maintenance task restores a minimum number of
//! idle connections per host, evicts connections that have idled too long,
//! and resets the creation window.
//!
//! A leased connection is represented by a
//! [`PooledConnection`](connection_pool/struct.PooledConnection.html) guard
//! that returns itself to the pool when it falls out of scope. The pool is
//! generic over the [`Connection`](connection/trait.Connection.html) trait
//! so its behavior can be exercised without sockets.
//!
//! ## Values on the wire
//!
//! Text and counter values travel as plain UTF-8 with no flag bits and
//! interoperate with any other memcached client. Binary values travel in a
//! tagged form marked with the `F_SERIALIZED` flag bit. Values larger than
//! a configurable threshold are gzip-compressed and marked `F_COMPRESSED`.
//! See the [`codec`](codec/index.html) module.
//!
//! ## Example
//!
//! ```rust,ignore
//! use snooker::client::{Client, ClientOptions};
//! use snooker::codec::Value;
//! use snooker::connection_pool::types::PoolOptions;
//!
//! let opts = ClientOptions {
//!     pool: PoolOptions {
//!         servers: vec!["127.0.0.1:11211".to_string()],
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//!
//! let client = Client::new(opts)?;
//! client.set("greeting", &Value::Text("hello".to_string()), 0)?;
//! let value = client.get("greeting")?;
//! client.shut_down();
//! ```

#![allow(missing_docs)]

pub mod backend;
pub mod client;
pub mod codec;
pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod hash;
pub mod protocol;
pub mod socket;
