// Copyright 2020 Joyent, Inc.

//! The operation layer: each public call leases a connection for the key,
//! runs exactly one protocol exchange, and returns the connection to the
//! pool (or destroys it after an I/O failure).

use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;
use slog::{debug, o, warn, Drain, Logger};

use crate::codec::{self, Value};
use crate::connection_pool::types::{
    PoolOptions, PoolStats, DEFAULT_SOCKET_TIMEOUT_MS,
};
use crate::connection_pool::{CreateConnection, Pool};
use crate::error::Error;
use crate::protocol::{self, MutateCommand, Protocol, StoreCommand};
use crate::socket::SocketConn;

lazy_static! {
    // The optional process-wide client instance.
    static ref INSTANCE: Mutex<Option<Client>> = Mutex::new(None);
}

/// Configuration for a [`Client`](struct.Client.html): the pool options
/// plus the value-codec switches.
#[derive(Debug, Default)]
pub struct ClientOptions {
    pub pool: PoolOptions,
    /// Gzip values larger than `compress_threshold`. Default true.
    pub compress_enable: Option<bool>,
    /// Byte threshold above which values are compressed. Default 15360.
    pub compress_threshold: Option<usize>,
}

/// A memcached client over a connection pool.
///
/// Clones share the same pool. All operations may be called concurrently
/// from any number of threads.
#[derive(Clone)]
pub struct Client {
    pool: Pool<SocketConn>,
    protocol: Protocol,
    log: Logger,
}

impl Client {
    /// Build a client, initialize its pool, and start maintenance.
    pub fn new(opts: ClientOptions) -> Result<Client, Error> {
        let log = opts
            .pool
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let compress_enable = opts.compress_enable.unwrap_or(true);
        let compress_threshold = opts
            .compress_threshold
            .unwrap_or(codec::DEFAULT_COMPRESS_THRESHOLD);
        let timeout_ms = opts
            .pool
            .socket_timeout_ms
            .unwrap_or(DEFAULT_SOCKET_TIMEOUT_MS);
        let nagle = opts.pool.nagle.unwrap_or(true);

        let create: CreateConnection<SocketConn> =
            Box::new(move |backend| SocketConn::new(backend, timeout_ms, nagle));
        let pool = Pool::new(opts.pool, create)?;
        pool.initialize()?;

        Ok(Client {
            pool,
            protocol: Protocol::new(
                compress_enable,
                compress_threshold,
                log.clone(),
            ),
            log,
        })
    }

    /// Install `client` as the process-wide instance.
    pub fn set_instance(client: Client) {
        *INSTANCE.lock().unwrap() = Some(client);
    }

    /// The process-wide instance, when one has been installed. A
    /// convenience only; constructing separate clients is always supported.
    pub fn instance() -> Option<Client> {
        INSTANCE.lock().unwrap().clone()
    }

    /// The underlying pool, for stats and manual routing.
    pub fn pool(&self) -> &Pool<SocketConn> {
        &self.pool
    }

    /// Connection counts for the underlying pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // Lease for `key`, run one exchange, and destroy the lease on I/O
    // failure so a broken socket never rejoins the idle set.
    fn with_key_conn<R>(
        &self,
        key: &str,
        hash: Option<u32>,
        op: impl FnOnce(&Protocol, &mut SocketConn) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut conn = match hash {
            Some(hv) => self.pool.acquire_with_hash(key, hv)?,
            None => self.pool.acquire(key)?,
        };
        let result = op(&self.protocol, &mut *conn);
        if let Err(Error::Io(_)) = &result {
            conn.invalidate();
        }
        result
    }

    /// Store `value` under `key` unconditionally. `expiry` is 0 (never
    /// expire) or a Unix epoch in seconds.
    pub fn set(
        &self,
        key: &str,
        value: &Value,
        expiry: i64,
    ) -> Result<bool, Error> {
        self.with_key_conn(key, None, |proto, conn| {
            proto.store(conn, StoreCommand::Set, key, value, expiry)
        })
    }

    /// `set` with a caller-supplied hash in place of the key hash.
    pub fn set_with_hash(
        &self,
        key: &str,
        value: &Value,
        expiry: i64,
        hash: u32,
    ) -> Result<bool, Error> {
        self.with_key_conn(key, Some(hash), |proto, conn| {
            proto.store(conn, StoreCommand::Set, key, value, expiry)
        })
    }

    /// Store only when `key` is absent. `Ok(false)` when it already exists.
    pub fn add(
        &self,
        key: &str,
        value: &Value,
        expiry: i64,
    ) -> Result<bool, Error> {
        self.with_key_conn(key, None, |proto, conn| {
            proto.store(conn, StoreCommand::Add, key, value, expiry)
        })
    }

    pub fn add_with_hash(
        &self,
        key: &str,
        value: &Value,
        expiry: i64,
        hash: u32,
    ) -> Result<bool, Error> {
        self.with_key_conn(key, Some(hash), |proto, conn| {
            proto.store(conn, StoreCommand::Add, key, value, expiry)
        })
    }

    /// Store only when `key` is present. `Ok(false)` when it is missing.
    pub fn replace(
        &self,
        key: &str,
        value: &Value,
        expiry: i64,
    ) -> Result<bool, Error> {
        self.with_key_conn(key, None, |proto, conn| {
            proto.store(conn, StoreCommand::Replace, key, value, expiry)
        })
    }

    pub fn replace_with_hash(
        &self,
        key: &str,
        value: &Value,
        expiry: i64,
        hash: u32,
    ) -> Result<bool, Error> {
        self.with_key_conn(key, Some(hash), |proto, conn| {
            proto.store(conn, StoreCommand::Replace, key, value, expiry)
        })
    }

    /// Fetch the value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        self.with_key_conn(key, None, |proto, conn| proto.retrieve(conn, key))
    }

    pub fn get_with_hash(
        &self,
        key: &str,
        hash: u32,
    ) -> Result<Option<Value>, Error> {
        self.with_key_conn(key, Some(hash), |proto, conn| {
            proto.retrieve(conn, key)
        })
    }

    /// Fetch many keys at once. Keys are partitioned by owning server and
    /// one multi-key `get` is issued per server; keys on unreachable
    /// servers are simply absent from the result.
    pub fn get_multi(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Value>, Error> {
        if !self.pool.is_initialized() {
            return Err(Error::NotInitialized);
        }
        for key in keys {
            protocol::check_key(key)?;
        }

        let mut by_host: HashMap<String, Vec<&str>> = HashMap::new();
        for &key in keys {
            match self.pool.route(key) {
                Some(host) => {
                    by_host.entry(host).or_insert_with(Vec::new).push(key)
                }
                None => debug!(self.log, "no live server for {:?}", key),
            }
        }

        let mut merged = HashMap::new();
        for (host, host_keys) in by_host {
            let mut conn = match self.pool.connection_to(&host) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(self.log, "skipping {}: {}", host, e);
                    continue;
                }
            };
            match self.protocol.retrieve_multi(&mut *conn, &host_keys) {
                Ok(values) => merged.extend(values),
                Err(Error::Io(e)) => {
                    conn.invalidate();
                    warn!(self.log, "multi-get against {} failed: {}", host, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(merged)
    }

    /// `get_multi`, re-projected to match the caller's key order.
    pub fn get_multi_array(
        &self,
        keys: &[&str],
    ) -> Result<Vec<Option<Value>>, Error> {
        let mut values = self.get_multi(keys)?;
        Ok(keys.iter().map(|key| values.remove(*key)).collect())
    }

    /// Delete `key`. `Ok(false)` when the server had no such key.
    pub fn delete(&self, key: &str) -> Result<bool, Error> {
        self.with_key_conn(key, None, |proto, conn| {
            proto.delete(conn, key, None)
        })
    }

    /// Delete `key` with the deletion-queue expiry some servers support.
    pub fn delete_with_expiry(
        &self,
        key: &str,
        expiry: i64,
    ) -> Result<bool, Error> {
        self.with_key_conn(key, None, |proto, conn| {
            proto.delete(conn, key, Some(expiry))
        })
    }

    /// Increment the counter at `key` by one. `Ok(None)` when it does not
    /// exist.
    pub fn incr(&self, key: &str) -> Result<Option<u64>, Error> {
        self.incr_by(key, 1)
    }

    pub fn incr_by(
        &self,
        key: &str,
        quantity: u64,
    ) -> Result<Option<u64>, Error> {
        self.with_key_conn(key, None, |proto, conn| {
            proto.mutate(conn, MutateCommand::Incr, key, quantity)
        })
    }

    /// Decrement the counter at `key` by one. The server clamps underflow
    /// to zero.
    pub fn decr(&self, key: &str) -> Result<Option<u64>, Error> {
        self.decr_by(key, 1)
    }

    pub fn decr_by(
        &self,
        key: &str,
        quantity: u64,
    ) -> Result<Option<u64>, Error> {
        self.with_key_conn(key, None, |proto, conn| {
            proto.mutate(conn, MutateCommand::Decr, key, quantity)
        })
    }

    /// Store a counter as its ASCII decimal representation so server-side
    /// `incr`/`decr` works against it.
    pub fn store_counter(&self, key: &str, value: u64) -> Result<bool, Error> {
        self.set(key, &Value::Counter(value), 0)
    }

    /// Read back a counter stored with `store_counter` (or mutated since).
    pub fn get_counter(&self, key: &str) -> Result<Option<u64>, Error> {
        match self.get(key)? {
            None => Ok(None),
            Some(Value::Counter(n)) => Ok(Some(n)),
            Some(Value::Text(text)) => {
                text.parse::<u64>().map(Some).map_err(|_| {
                    Error::Protocol(format!(
                        "{:?} does not hold a counter: {:?}",
                        key, text
                    ))
                })
            }
            Some(Value::Blob(_)) => Err(Error::Protocol(format!(
                "{:?} does not hold a counter",
                key
            ))),
        }
    }

    /// Flush every configured server. All servers are attempted; the first
    /// failure is reported once the sweep finishes.
    pub fn flush_all(&self) -> Result<(), Error> {
        if !self.pool.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let mut first_err = None;
        for host in self.pool.hosts() {
            let outcome = self.pool.connection_to(&host).and_then(|mut conn| {
                let result = self.protocol.flush_all(&mut *conn);
                if let Err(Error::Io(_)) = &result {
                    conn.invalidate();
                }
                result
            });
            if let Err(e) = outcome {
                warn!(self.log, "flush_all against {} failed: {}", host, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Per-server statistics. Unreachable servers are absent from the map.
    pub fn stats(
        &self,
    ) -> Result<HashMap<String, HashMap<String, String>>, Error> {
        if !self.pool.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let mut all = HashMap::new();
        for host in self.pool.hosts() {
            let mut conn = match self.pool.connection_to(&host) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(self.log, "skipping {}: {}", host, e);
                    continue;
                }
            };
            match self.protocol.stats(&mut *conn) {
                Ok(stats) => {
                    // One insertion per server, after its reply is fully
                    // read.
                    all.insert(host, stats);
                }
                Err(e) => {
                    if let Error::Io(_) = e {
                        conn.invalidate();
                    }
                    warn!(self.log, "stats against {} failed: {}", host, e);
                }
            }
        }
        Ok(all)
    }

    /// Shut the pool down. Subsequent operations fail with
    /// `NotInitialized` until the pool is re-initialized.
    pub fn shut_down(&self) {
        self.pool.shut_down();
    }
}
