// Copyright 2020 Joyent, Inc.

pub mod types;

use std::cmp;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::backend::{Backend, BackendKey};
use crate::connection::Connection;
use crate::connection_pool::types::{
    ConnectionCount, ConnectionId, DeadHost, IdleConnection, MaintSignal,
    PoolConfig, PoolData, PoolOptions, PoolStats, ProtectedData,
};
use crate::error::Error;
use crate::hash;

// Hard cap on connections opened by a single idle miss, and the saturation
// point for the create-shift doubling.
const MAX_CREATE: usize = 10;
// Divisor applied to the idle excess when deciding how many connections one
// maintenance pass may evict.
const POOL_MULTIPLIER: usize = 3;
// First dead-host backoff window; doubles on each renewed failure.
const INITIAL_DEAD_BACKOFF: Duration = Duration::from_millis(1000);

/// The connection factory. Invoked under the pool monitor whenever the
/// idle set for a host comes up empty.
pub type CreateConnection<C> =
    Box<dyn Fn(&Backend) -> C + Send + Sync + 'static>;

/// A pool of connections to a weighted set of memcached servers.
///
/// The pool is constructed empty; `initialize` builds the bucket vector,
/// opens the initial connections, and starts the maintenance loop. Clones
/// share the same underlying pool.
pub struct Pool<C>
where
    C: Connection,
{
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for Pool<C>
where
    C: Connection,
{
    fn clone(&self) -> Pool<C> {
        Pool {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<C>
where
    C: Connection,
{
    protected_data: ProtectedData<C>,
    config: PoolConfig,
    servers: Vec<String>,
    weights: Option<Vec<u32>>,
    create_connection: CreateConnection<C>,
    next_id: AtomicU64,
    maint_signal: MaintSignal,
    maint_thread: Mutex<Option<thread::JoinHandle<()>>>,
    log: Logger,
}

impl<C> Pool<C>
where
    C: Connection,
{
    /// Construct an empty pool. No connections are opened and no background
    /// work starts until [`initialize`](#method.initialize) runs.
    pub fn new(
        opts: PoolOptions,
        create_connection: CreateConnection<C>,
    ) -> Result<Self, Error> {
        if opts.servers.is_empty() {
            return Err(Error::BadServerList("no servers configured".into()));
        }
        if let Some(weights) = &opts.weights {
            if weights.len() != opts.servers.len() {
                return Err(Error::BadServerList(format!(
                    "{} servers but {} weights",
                    opts.servers.len(),
                    weights.len()
                )));
            }
            if weights.iter().any(|&w| w == 0) {
                return Err(Error::BadServerList(
                    "weights must be positive".into(),
                ));
            }
        }

        let log = opts
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let config = PoolConfig::from_options(&opts);

        Ok(Pool {
            inner: Arc::new(PoolInner {
                protected_data: ProtectedData::new(PoolData::new()),
                config,
                servers: opts.servers,
                weights: opts.weights,
                create_connection,
                next_id: AtomicU64::new(1),
                maint_signal: MaintSignal::new(),
                maint_thread: Mutex::new(None),
                log,
            }),
        })
    }

    /// Build the bucket vector, open `init_conn` connections per live
    /// server, and start the maintenance loop when enabled. A no-op on an
    /// already-initialized pool.
    pub fn initialize(&self) -> Result<(), Error> {
        let inner = &self.inner;
        {
            let mut data = inner.protected_data.lock();
            if data.initialized {
                return Ok(());
            }

            // The bucket vector is rebuilt only here and is immutable until
            // shutdown. A server with weight w appears w times
            // consecutively, in configuration order.
            let mut buckets = Vec::new();
            for (i, addr) in inner.servers.iter().enumerate() {
                let backend = Backend::parse(addr)?;
                let weight =
                    inner.weights.as_ref().map_or(1, |weights| weights[i]);
                for _ in 0..weight {
                    buckets.push(backend.name.clone());
                }
                data.backends.insert(backend.name.clone(), backend);
            }
            data.buckets = buckets;
            data.initialized = true;

            let hosts: Vec<BackendKey> =
                data.backends.keys().cloned().collect();
            for host in &hosts {
                for _ in 0..inner.config.init_conn {
                    match open_connection(inner, &mut data, host) {
                        Some(conn) => {
                            let id = next_id(inner);
                            data.idle
                                .entry(host.clone())
                                .or_insert_with(VecDeque::new)
                                .push_back(IdleConnection {
                                    id,
                                    conn,
                                    since: Instant::now(),
                                });
                        }
                        None => break,
                    }
                }
            }

            info!(
                inner.log,
                "pool initialized with {} buckets across {} hosts",
                data.buckets.len(),
                data.backends.len()
            );
        }

        if inner.config.maint_sleep > Duration::from_millis(0) {
            self.start_maintenance();
        }
        Ok(())
    }

    /// Lease a connection for the server owning `key`.
    pub fn acquire(&self, key: &str) -> Result<PooledConnection<C>, Error> {
        let hv = hash::hash_key(self.inner.config.hash_scheme, key);
        self.acquire_with_hash(key, hv)
    }

    /// Lease a connection using a caller-supplied hash instead of hashing
    /// `key`.
    pub fn acquire_with_hash(
        &self,
        key: &str,
        hash_value: u32,
    ) -> Result<PooledConnection<C>, Error> {
        let inner = &self.inner;
        let mut data = inner.protected_data.lock();
        if !data.initialized {
            return Err(Error::NotInitialized);
        }
        if data.buckets.is_empty() {
            return Err(Error::Unreachable("bucket vector is empty".into()));
        }

        if data.buckets.len() == 1 {
            let host = data.buckets[0].clone();
            return lease(inner, &mut data, &host)
                .ok_or(Error::Unreachable(host));
        }

        trace!(inner.log, "acquire {:?} with hash {:#x}", key, hash_value);
        let nbuckets = data.buckets.len();
        let mut hv = hash_value;
        for iteration in 0..nbuckets {
            let host = data.buckets[hv as usize % nbuckets].clone();
            if let Some(leased) = lease(inner, &mut data, &host) {
                return Ok(leased);
            }
            if !inner.config.failover {
                return Err(Error::Unreachable(host));
            }
            trace!(inner.log, "failing over from {}", host);
            hv = hash::rehash(hv, iteration);
        }
        Err(Error::Unreachable(format!(
            "no live server after {} attempts",
            nbuckets
        )))
    }

    /// Lease a connection to a specific server, bypassing key hashing.
    pub fn connection_to(
        &self,
        host: &str,
    ) -> Result<PooledConnection<C>, Error> {
        let inner = &self.inner;
        let mut data = inner.protected_data.lock();
        if !data.initialized {
            return Err(Error::NotInitialized);
        }
        if !data.backends.contains_key(host) {
            return Err(Error::Unreachable(format!(
                "{} is not a configured server",
                host
            )));
        }
        let host = host.to_string();
        lease(inner, &mut data, &host).ok_or(Error::Unreachable(host))
    }

    /// The live server that currently owns `key`, without opening a
    /// connection. Mirrors the acquire walk against the dead-host map;
    /// `None` when every candidate sits inside its dead window.
    pub fn route(&self, key: &str) -> Option<BackendKey> {
        let inner = &self.inner;
        let data = inner.protected_data.lock();
        if !data.initialized || data.buckets.is_empty() {
            return None;
        }
        let now = Instant::now();
        let nbuckets = data.buckets.len();
        let mut hv = hash::hash_key(inner.config.hash_scheme, key);
        for iteration in 0..nbuckets {
            let host = &data.buckets[hv as usize % nbuckets];
            let dead = data
                .dead
                .get(host)
                .map_or(false, |record| record.window_open(now));
            if !dead {
                return Some(host.clone());
            }
            if !inner.config.failover {
                return None;
            }
            hv = hash::rehash(hv, iteration);
        }
        None
    }

    /// The distinct configured servers, in configuration order. Empty
    /// before initialize.
    pub fn hosts(&self) -> Vec<BackendKey> {
        let data = self.inner.protected_data.lock();
        let mut hosts = Vec::new();
        for host in &data.buckets {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }

    /// Connection counts, computed from the pool maps.
    pub fn stats(&self) -> PoolStats {
        let data = self.inner.protected_data.lock();
        let idle: usize = data.idle.values().map(VecDeque::len).sum();
        let busy = data.busy.len();
        PoolStats {
            total_connections: ConnectionCount::from((idle + busy) as u32),
            idle_connections: ConnectionCount::from(idle as u32),
            busy_connections: ConnectionCount::from(busy as u32),
        }
    }

    /// Idle connections currently banked for `host`.
    pub fn idle_count(&self, host: &str) -> usize {
        self.inner
            .protected_data
            .lock()
            .idle
            .get(host)
            .map_or(0, VecDeque::len)
    }

    /// Length of the bucket vector: the sum of the server weights.
    pub fn bucket_count(&self) -> usize {
        self.inner.protected_data.lock().buckets.len()
    }

    /// The current backoff window for `host`, when it is marked dead.
    pub fn dead_backoff(&self, host: &str) -> Option<Duration> {
        self.inner
            .protected_data
            .lock()
            .dead
            .get(host)
            .map(|record| record.backoff)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.protected_data.lock().initialized
    }

    /// Stop maintenance, close every idle connection, and clear all pool
    /// state. Outstanding leases are destroyed as they are checked in.
    /// Operations fail with `NotInitialized` until `initialize` runs again.
    pub fn shut_down(&self) {
        let inner = &self.inner;
        inner.maint_signal.raise();
        if let Some(handle) = inner.maint_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut data = inner.protected_data.lock();
        let idle = std::mem::take(&mut data.idle);
        for (host, queue) in idle {
            for mut entry in queue {
                if let Err(e) = entry.conn.close() {
                    warn!(
                        inner.log,
                        "error closing connection to {}: {}", host, e
                    );
                }
            }
        }
        data.busy.clear();
        data.dead.clear();
        data.create_shift.clear();
        data.backends.clear();
        data.buckets.clear();
        data.initialized = false;
        info!(inner.log, "pool shut down");
    }

    fn start_maintenance(&self) {
        let inner = &self.inner;
        inner.maint_signal.reset();
        let loop_inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || maintenance_loop(loop_inner));
        *inner.maint_thread.lock().unwrap() = Some(handle);
    }
}

fn next_id<C>(inner: &PoolInner<C>) -> ConnectionId
where
    C: Connection,
{
    inner.next_id.fetch_add(1, AtomicOrdering::Relaxed)
}

// Open one connection to `host`. A connect failure records (or renews) the
// dead-host backoff; a success clears it.
fn open_connection<C>(
    inner: &PoolInner<C>,
    data: &mut PoolData<C>,
    host: &BackendKey,
) -> Option<C>
where
    C: Connection,
{
    let backend = match data.backends.get(host) {
        Some(backend) => backend.clone(),
        None => return None,
    };
    let mut conn = (inner.create_connection)(&backend);
    match conn.connect() {
        Ok(()) => {
            data.dead.remove(host);
            Some(conn)
        }
        Err(e) => {
            warn!(inner.log, "connect to {} failed: {}", host, e);
            mark_dead(inner, data, host);
            None
        }
    }
}

fn mark_dead<C>(inner: &PoolInner<C>, data: &mut PoolData<C>, host: &BackendKey)
where
    C: Connection,
{
    let now = Instant::now();
    let record = match data.dead.get(host) {
        // Renewed failure: double the window and restamp it, otherwise a
        // long-dead host's window would never reopen.
        Some(prev) => DeadHost {
            since: now,
            backoff: prev.backoff * 2,
        },
        None => DeadHost {
            since: now,
            backoff: INITIAL_DEAD_BACKOFF,
        },
    };
    debug!(inner.log, "host {} dead for {:?}", host, record.backoff);
    data.dead.insert(host.clone(), record);
}

// The per-host acquisition step: dead-window check, idle scan with probe,
// then sliding-window creation on a miss.
fn lease<C>(
    inner: &Arc<PoolInner<C>>,
    data: &mut PoolData<C>,
    host: &BackendKey,
) -> Option<PooledConnection<C>>
where
    C: Connection,
{
    let now = Instant::now();
    if let Some(record) = data.dead.get(host) {
        if record.window_open(now) {
            trace!(inner.log, "{} is inside its dead window", host);
            return None;
        }
    }

    // Entries that fail the probe are destroyed, never leased.
    while let Some(mut entry) =
        data.idle.get_mut(host).and_then(|queue| queue.pop_front())
    {
        if entry.conn.is_alive() {
            data.busy.insert(entry.id, host.clone());
            return Some(PooledConnection::new(
                Arc::clone(inner),
                entry.id,
                host.clone(),
                entry.conn,
            ));
        }
        debug!(inner.log, "discarding dead idle connection to {}", host);
        let _ = entry.conn.close();
    }

    // Idle miss: open min(1 << shift, MAX_CREATE) connections, bank all but
    // the last, and lease the last.
    let shift = data.create_shift.get(host).copied().unwrap_or(0);
    let create = cmp::min(1usize << shift, MAX_CREATE);
    let mut opened = Vec::with_capacity(create);
    for _ in 0..create {
        match open_connection(inner, data, host) {
            Some(conn) => opened.push(conn),
            None => break,
        }
    }
    let leased = opened.pop()?;
    if (1usize << shift) < MAX_CREATE {
        data.create_shift.insert(host.clone(), shift + 1);
    }
    for conn in opened {
        let id = next_id(inner);
        data.idle
            .entry(host.clone())
            .or_insert_with(VecDeque::new)
            .push_back(IdleConnection {
                id,
                conn,
                since: Instant::now(),
            });
    }
    let id = next_id(inner);
    data.busy.insert(id, host.clone());
    Some(PooledConnection::new(
        Arc::clone(inner),
        id,
        host.clone(),
        leased,
    ))
}

// Remove a lease from the busy set and either bank or destroy the
// connection. Release comes through here with add_to_avail set; an
// invalidated lease or a shut-down pool destroys instead.
fn check_in<C>(
    inner: &PoolInner<C>,
    id: ConnectionId,
    host: &BackendKey,
    mut conn: C,
    add_to_avail: bool,
) where
    C: Connection,
{
    let mut data = inner.protected_data.lock();
    data.busy.remove(&id);
    if add_to_avail && data.initialized && conn.is_alive() {
        trace!(inner.log, "connection {} to {} back to idle", id, host);
        data.idle
            .entry(host.clone())
            .or_insert_with(VecDeque::new)
            .push_back(IdleConnection {
                id,
                conn,
                since: Instant::now(),
            });
    } else {
        debug!(inner.log, "destroying connection {} to {}", id, host);
        if let Err(e) = conn.close() {
            warn!(inner.log, "error closing connection to {}: {}", host, e);
        }
    }
}

// One long sleep -> pass loop. Exits on the stop signal; per-host failures
// inside a pass are logged and swallowed so transient trouble cannot kill
// the task.
fn maintenance_loop<C>(inner: Arc<PoolInner<C>>)
where
    C: Connection,
{
    trace!(inner.log, "maintenance loop starting");
    loop {
        if inner.maint_signal.wait(inner.config.maint_sleep) {
            break;
        }
        maintenance_pass(&inner);
    }
    trace!(inner.log, "maintenance loop exiting");
}

fn maintenance_pass<C>(inner: &Arc<PoolInner<C>>)
where
    C: Connection,
{
    let config = &inner.config;
    let mut data = inner.protected_data.lock();
    if !data.initialized {
        return;
    }

    let now = Instant::now();
    let hosts: Vec<BackendKey> = data.backends.keys().cloned().collect();
    for host in &hosts {
        if data
            .dead
            .get(host)
            .map_or(false, |record| record.window_open(now))
        {
            continue;
        }

        let idle_len = data.idle.get(host).map_or(0, VecDeque::len);
        if idle_len < config.min_conn {
            let wanted = config.min_conn - idle_len;
            debug!(inner.log, "topping {} up by {}", host, wanted);
            for _ in 0..wanted {
                match open_connection(inner, &mut data, host) {
                    Some(conn) => {
                        let id = next_id(inner);
                        data.idle
                            .entry(host.clone())
                            .or_insert_with(VecDeque::new)
                            .push_back(IdleConnection {
                                id,
                                conn,
                                since: Instant::now(),
                            });
                    }
                    None => break,
                }
            }
        } else if idle_len > config.max_conn {
            // Evict the oldest entries that have sat past max_idle, capped
            // per pass so one sweep cannot empty the pool.
            let excess = idle_len - config.max_conn;
            let quota = cmp::max(1, excess / POOL_MULTIPLIER);
            let mut evicted = Vec::new();
            if let Some(queue) = data.idle.get_mut(host) {
                let mut kept = VecDeque::with_capacity(queue.len());
                while let Some(entry) = queue.pop_front() {
                    if evicted.len() < quota
                        && now.duration_since(entry.since) > config.max_idle
                    {
                        evicted.push(entry);
                    } else {
                        kept.push_back(entry);
                    }
                }
                *queue = kept;
            }
            for mut entry in evicted {
                debug!(
                    inner.log,
                    "evicting idle connection {} to {}", entry.id, host
                );
                let _ = entry.conn.close();
            }
        }
    }

    // Every host starts the next window from scratch.
    data.create_shift.clear();
}

/// A leased pool member. Dereferences to the underlying connection and
/// returns itself to the pool when it falls out of scope.
pub struct PooledConnection<C>
where
    C: Connection,
{
    pool: Arc<PoolInner<C>>,
    id: ConnectionId,
    host: BackendKey,
    conn: Option<C>,
    broken: bool,
}

impl<C> PooledConnection<C>
where
    C: Connection,
{
    fn new(
        pool: Arc<PoolInner<C>>,
        id: ConnectionId,
        host: BackendKey,
        conn: C,
    ) -> Self {
        PooledConnection {
            pool,
            id,
            host,
            conn: Some(conn),
            broken: false,
        }
    }

    /// The server this lease points at.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Mark the lease broken: on drop the connection is destroyed instead
    /// of rejoining the idle set. Call after any I/O failure.
    pub fn invalidate(&mut self) {
        self.broken = true;
    }
}

impl<C> Drop for PooledConnection<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            check_in(&self.pool, self.id, &self.host, conn, !self.broken);
        }
    }
}

impl<C> Deref for PooledConnection<C>
where
    C: Connection,
{
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().unwrap()
    }
}

impl<C> DerefMut for PooledConnection<C>
where
    C: Connection,
{
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap()
    }
}
