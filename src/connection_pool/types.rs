// Copyright 2020 Joyent, Inc.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::backend::{Backend, BackendKey};
use crate::connection::Connection;
use crate::hash::HashScheme;

/// Connections opened per host when the pool is initialized.
pub const DEFAULT_INIT_CONN: usize = 3;
/// Lower bound the maintenance loop restores each pass.
pub const DEFAULT_MIN_CONN: usize = 3;
/// Idle count above which the maintenance loop may evict.
pub const DEFAULT_MAX_CONN: usize = 10;
/// Idle age beyond which a connection is eligible for eviction.
pub const DEFAULT_MAX_IDLE_MS: u64 = 180_000;
/// Sleep between maintenance passes. Zero disables the loop.
pub const DEFAULT_MAINT_SLEEP_MS: u64 = 5_000;
/// Per-read socket timeout.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 10_000;

/// The configuration options for a connection pool. Unset fields take the
/// `DEFAULT_*` values above.
#[derive(Debug, Default)]
pub struct PoolOptions {
    /// Ordered list of `host:port` server addresses. Required;
    /// initialization fails when the list is empty.
    pub servers: Vec<String>,
    /// Optional per-server multiplicities for the bucket vector. When
    /// present the length must match `servers` and every entry must be
    /// positive; when absent every server has weight 1.
    pub weights: Option<Vec<u32>>,
    /// Connections opened per live server at initialize.
    pub init_conn: Option<usize>,
    /// Idle connections restored per host by each maintenance pass.
    pub min_conn: Option<usize>,
    /// Idle count above which a maintenance pass may evict.
    pub max_conn: Option<usize>,
    /// Milliseconds a connection may sit idle before it is eligible for
    /// eviction.
    pub max_idle_ms: Option<u64>,
    /// Milliseconds between maintenance passes; zero disables the loop.
    pub maint_sleep_ms: Option<u64>,
    /// Per-read socket timeout in milliseconds. Consumed by the connection
    /// factory the client installs; zero blocks indefinitely.
    pub socket_timeout_ms: Option<u64>,
    /// Rehash and retry against an alternate bucket when the selected
    /// server is unavailable. Default true.
    pub failover: Option<bool>,
    /// When false, TCP_NODELAY is set on new sockets. Default true.
    pub nagle: Option<bool>,
    /// Which key hash maps keys to buckets.
    pub hash_scheme: Option<HashScheme>,
    /// An optional `slog` logger instance. If none is provided the logging
    /// falls back to the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain, essentially the same as using the standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

// The resolved, defaulted configuration the pool actually runs with.
#[doc(hidden)]
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub init_conn: usize,
    pub min_conn: usize,
    pub max_conn: usize,
    pub max_idle: Duration,
    pub maint_sleep: Duration,
    pub failover: bool,
    pub hash_scheme: HashScheme,
}

impl PoolConfig {
    pub fn from_options(opts: &PoolOptions) -> Self {
        PoolConfig {
            init_conn: opts.init_conn.unwrap_or(DEFAULT_INIT_CONN),
            min_conn: opts.min_conn.unwrap_or(DEFAULT_MIN_CONN),
            max_conn: opts.max_conn.unwrap_or(DEFAULT_MAX_CONN),
            max_idle: Duration::from_millis(
                opts.max_idle_ms.unwrap_or(DEFAULT_MAX_IDLE_MS),
            ),
            maint_sleep: Duration::from_millis(
                opts.maint_sleep_ms.unwrap_or(DEFAULT_MAINT_SLEEP_MS),
            ),
            failover: opts.failover.unwrap_or(true),
            hash_scheme: opts.hash_scheme.unwrap_or_default(),
        }
    }
}

/// A newtype wrapper around u32 used for counts of connections maintained
/// by the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// A snapshot of the pool's connection counts, computed from the pool maps
/// under the monitor so the numbers cannot drift from the truth.
#[derive(Copy, Clone, Debug)]
pub struct PoolStats {
    /// Idle plus busy connections.
    pub total_connections: ConnectionCount,
    /// Connections banked in the per-host idle sets.
    pub idle_connections: ConnectionCount,
    /// Connections currently leased out.
    pub busy_connections: ConnectionCount,
}

/// Identity of a pool member, assigned at creation and carried through the
/// busy set.
pub type ConnectionId = u64;

// An idle pool member and the time it was returned.
#[doc(hidden)]
pub struct IdleConnection<C> {
    pub id: ConnectionId,
    pub conn: C,
    pub since: Instant,
}

/// Failure-backoff record for a server that refused a connection. While
/// `now < since + backoff` no connect to the host is attempted; the record
/// is cleared by the first successful connect.
#[derive(Clone, Copy, Debug)]
pub struct DeadHost {
    pub since: Instant,
    pub backoff: Duration,
}

impl DeadHost {
    pub fn window_open(&self, now: Instant) -> bool {
        now.duration_since(self.since) < self.backoff
    }
}

// The internal data structures used to manage the connection pool. All
// fields are mutated only under the ProtectedData lock.
#[doc(hidden)]
pub struct PoolData<C> {
    pub buckets: Vec<BackendKey>,
    pub backends: HashMap<BackendKey, Backend>,
    pub idle: HashMap<BackendKey, VecDeque<IdleConnection<C>>>,
    pub busy: HashMap<ConnectionId, BackendKey>,
    pub dead: HashMap<BackendKey, DeadHost>,
    pub create_shift: HashMap<BackendKey, u32>,
    pub initialized: bool,
}

impl<C> PoolData<C>
where
    C: Connection,
{
    #[doc(hidden)]
    pub fn new() -> Self {
        PoolData {
            buckets: Vec::new(),
            backends: HashMap::new(),
            idle: HashMap::new(),
            busy: HashMap::new(),
            dead: HashMap::new(),
            create_shift: HashMap::new(),
            initialized: false,
        }
    }
}

// Protected access to the internal connection pool data structures
#[doc(hidden)]
pub struct ProtectedData<C>(Arc<Mutex<PoolData<C>>>);

impl<C> ProtectedData<C>
where
    C: Connection,
{
    pub fn new(data: PoolData<C>) -> Self {
        ProtectedData(Arc::new(Mutex::new(data)))
    }

    pub fn lock(&self) -> MutexGuard<PoolData<C>> {
        self.0.lock().unwrap()
    }
}

impl<C> Clone for ProtectedData<C>
where
    C: Connection,
{
    fn clone(&self) -> ProtectedData<C> {
        ProtectedData(Arc::clone(&self.0))
    }
}

// Stop/wakeup signal for the maintenance thread: a stop flag plus one
// condvar so shutdown interrupts the inter-pass sleep.
#[doc(hidden)]
#[derive(Default)]
pub struct MaintSignal(Arc<(Mutex<bool>, Condvar)>);

impl MaintSignal {
    pub fn new() -> Self {
        MaintSignal(Arc::new((Mutex::new(false), Condvar::new())))
    }

    // Sleep up to `timeout` or until raised. Returns the stop flag.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.0;
        let guard = lock.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _result) = cvar.wait_timeout(guard, timeout).unwrap();
        *guard
    }

    pub fn raise(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn reset(&self) {
        let (lock, _cvar) = &*self.0;
        *lock.lock().unwrap() = false;
    }
}

impl Clone for MaintSignal {
    fn clone(&self) -> MaintSignal {
        MaintSignal(Arc::clone(&self.0))
    }
}
