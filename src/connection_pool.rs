// Copyright 2020 Joyent, Inc.

mod shard;
pub mod types;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slog::{debug, info, o, warn, Drain, Logger};

use crate::backend::Backend;
use crate::connection::{Connection, ConnectionFactory, ConnectionTimeouts};
use crate::connection_pool::shard::{PoolShard, PooledEntry, ShardGet};
use crate::connection_pool::types::{
    ConnectionPoolOptions, PoolStats, ShardConfig, ShardId,
};
use crate::error::Error;

// Shard attempts a get makes before reporting exhaustion
const MAX_GET_ATTEMPTS: usize = 5;
// Health checker tick interval
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
// Dial attempts per health probe
const PROBE_ATTEMPTS: u32 = 2;
// Connect and read/write timeout for health probe dials, in milliseconds
const PROBE_TIMEOUT: u64 = 100;

// The state shared by every handle on the pool: the shard vector, the
// rotation index, and the availability accounting maintained by the health
// checker thread.
struct PoolInner<C> {
    shards: Vec<PoolShard<C>>,
    factory: ConnectionFactory<C>,
    index: AtomicUsize,
    num_available: AtomicUsize,
    closed: AtomicBool,
    log: Logger,
}

impl<C> PoolInner<C>
where
    C: Connection,
{
    // Record a health probe verdict for a shard. Promotion always goes
    // through; demotion is gated so that strictly more than two thirds of
    // the shards stay available, which keeps correlated probe failures from
    // taking the whole pool out of rotation. `num_available` is only ever
    // written by the health checker thread.
    fn mark_available(&self, shard: &PoolShard<C>, ok: bool) {
        if ok {
            if shard.mark_available(true) {
                self.num_available.fetch_add(1, Ordering::Relaxed);
                info!(self.log, "server recovered: {}", shard.backend());
            }
        } else {
            let available = self.num_available.load(Ordering::Relaxed);
            if available * 3 > self.shards.len() * 2 {
                if shard.mark_available(false) {
                    self.num_available.fetch_sub(1, Ordering::Relaxed);
                    warn!(
                        self.log,
                        "marking server unavailable: {}",
                        shard.backend()
                    );
                }
            } else {
                warn!(
                    self.log,
                    "server {} cannot be marked unavailable, \
                     too many failed shards, available: {}, total: {}",
                    shard.backend(),
                    available,
                    self.shards.len()
                );
            }
        }
    }
}

/// A pool of connections sharded across a set of logically equivalent
/// backend servers.
///
/// Each backend gets its own shard: an idle LIFO stack of pre-opened
/// connections with caps on idle and open connections. `get` rotates across
/// the shards, skipping any the health checker has marked unavailable, and
/// `put` hands a connection straight back to the shard that owns it. A
/// background thread re-probes suspect backends once a second and moves them
/// in and out of rotation.
///
/// The pool is generic over the connection type; callers supply a factory
/// that knows how to construct one for a backend. The pool only ever dials
/// and drops connections, it never looks inside them.
pub struct ConnectionPool<C>
where
    C: Connection,
{
    inner: Arc<PoolInner<C>>,
    health_thread: Option<thread::JoinHandle<()>>,
}

impl<C> ConnectionPool<C>
where
    C: Connection,
{
    /// Create a pool over the given backends.
    ///
    /// One shard is created per backend and every shard starts out
    /// available. The health checker thread is started here and runs until
    /// [`shutdown`](#method.shutdown).
    ///
    /// # Panics
    ///
    /// Panics if `backends` is empty.
    pub fn new<F>(
        backends: Vec<Backend>,
        options: ConnectionPoolOptions,
        create_connection: F,
    ) -> Self
    where
        F: Fn(&Backend, &ConnectionTimeouts) -> C + Send + Sync + 'static,
    {
        assert!(
            !backends.is_empty(),
            "connection pool requires at least one backend"
        );

        let config = ShardConfig::from_options(&options);
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let factory: ConnectionFactory<C> = Arc::new(create_connection);

        let num_backends = backends.len();
        let shards = backends
            .into_iter()
            .enumerate()
            .map(|(id, backend)| {
                PoolShard::new(
                    backend,
                    ShardId::from(id),
                    config,
                    Arc::clone(&factory),
                    log.clone(),
                )
            })
            .collect();

        let inner = Arc::new(PoolInner {
            shards,
            factory,
            index: AtomicUsize::new(0),
            num_available: AtomicUsize::new(num_backends),
            closed: AtomicBool::new(false),
            log,
        });

        let health_inner = Arc::clone(&inner);
        let health_thread =
            thread::spawn(move || health_check_loop(health_inner));

        ConnectionPool {
            inner,
            health_thread: Some(health_thread),
        }
    }

    /// Borrow a connection from the pool.
    ///
    /// Starts at the next shard in the rotation and makes up to five
    /// attempts, skipping shards that are out of rotation. A shard that
    /// comes up empty or fails to dial absorbs the failure into its own
    /// accounting and the rotation moves on; the skip also bumps the
    /// rotation index an extra time so concurrent callers fan out instead of
    /// converging on the same unhealthy shard. If every attempt fails the
    /// pool reports [`Error::Exhausted`](../error/enum.Error.html).
    pub fn get(&self) -> Result<PoolConnection<C>, Error> {
        let num_shards = self.inner.shards.len();
        let local_index = self.inner.index.fetch_add(1, Ordering::Relaxed);

        for tries in 0..MAX_GET_ATTEMPTS {
            let idx = local_index.wrapping_add(tries) % num_shards;
            let shard = &self.inner.shards[idx];

            if !shard.is_available() {
                self.inner.index.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match shard.get() {
                ShardGet::Conn(entry) => {
                    return Ok(PoolConnection {
                        pool: Arc::clone(&self.inner),
                        entry: Some(entry),
                    });
                }
                _ => {
                    self.inner.index.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Err(Error::Exhausted)
    }

    /// Return a borrowed connection to the shard that owns it.
    ///
    /// The shard is resolved from the connection's back-reference, so this
    /// never searches. Pass `broken = true` if your own use of the
    /// connection failed; the pool does not infer brokenness, and a broken
    /// return is disposed of instead of re-idled. Dropping the guard without
    /// calling `put` returns the connection as not broken.
    pub fn put(&self, conn: PoolConnection<C>, broken: bool) {
        conn.finish(broken);
    }

    /// Snapshot per-shard statistics, one entry per backend in construction
    /// order. Counters cover the window since the previous snapshot and are
    /// reset by the read.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.inner.shards.iter().map(|s| s.stats()).collect()
    }

    /// The number of shards currently in rotation. Maintained by the health
    /// checker thread; readers may observe a briefly stale value.
    pub fn num_available(&self) -> usize {
        self.inner.num_available.load(Ordering::Relaxed)
    }

    /// Shut the pool down: stop the health checker, close every shard, and
    /// drain their idle connections. No new connections are dialed
    /// afterwards and subsequent `get` calls fail. Shutdown is idempotent;
    /// re-entering it just logs. Connections still borrowed at shutdown are
    /// disposed of when they are returned.
    pub fn shutdown(&mut self) {
        let first = self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !first {
            warn!(self.inner.log, "pool already closed");
        }

        // Only the original handle holds the join handle; the checker
        // observes `closed` at its next tick.
        if let Some(handle) = self.health_thread.take() {
            let _ = handle.join();
        }

        if first {
            for shard in &self.inner.shards {
                shard.close();
            }
            info!(self.inner.log, "pool shut down");
        }
    }
}

impl<C> Clone for ConnectionPool<C>
where
    C: Connection,
{
    fn clone(&self) -> ConnectionPool<C> {
        ConnectionPool {
            inner: Arc::clone(&self.inner),
            health_thread: None,
        }
    }
}

impl<C> Drop for ConnectionPool<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        // Clones share the pool state but do not own it; only the original
        // handle tears the pool down.
        if self.health_thread.is_some() {
            self.shutdown();
        }
    }
}

/// A borrowed connection, owned by the caller until it is handed back with
/// [`ConnectionPool::put`](struct.ConnectionPool.html#method.put) or
/// dropped. Dereferences to the caller's connection type.
pub struct PoolConnection<C>
where
    C: Connection,
{
    pool: Arc<PoolInner<C>>,
    entry: Option<PooledEntry<C>>,
}

impl<C> PoolConnection<C>
where
    C: Connection,
{
    /// The backend this connection was dialed against.
    pub fn backend(&self) -> &Backend {
        let entry = self.entry.as_ref().unwrap();
        let shard_id: usize = entry.shard_id.into();
        self.pool.shards[shard_id].backend()
    }

    fn finish(mut self, broken: bool) {
        if let Some(entry) = self.entry.take() {
            let shard_id: usize = entry.shard_id.into();
            self.pool.shards[shard_id].put(entry, broken);
        }
    }
}

impl<C> Drop for PoolConnection<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            let shard_id: usize = entry.shard_id.into();
            self.pool.shards[shard_id].put(entry, false);
        }
    }
}

impl<C> Deref for PoolConnection<C>
where
    C: Connection,
{
    type Target = C;

    fn deref(&self) -> &C {
        &self.entry.as_ref().unwrap().conn
    }
}

impl<C> DerefMut for PoolConnection<C>
where
    C: Connection,
{
    fn deref_mut(&mut self) -> &mut C {
        &mut self.entry.as_mut().unwrap().conn
    }
}

// Health checker thread routine. Every tick it re-probes the shards that
// are out of rotation or carrying a failure streak, and feeds the verdicts
// through the availability gate. Exits at the first tick boundary after the
// pool is closed.
fn health_check_loop<C>(inner: Arc<PoolInner<C>>)
where
    C: Connection,
{
    while !inner.closed.load(Ordering::Relaxed) {
        thread::sleep(HEALTH_CHECK_INTERVAL);

        for shard in &inner.shards {
            if inner.closed.load(Ordering::Relaxed) {
                break;
            }
            if shard.is_available() && !shard.is_suspectable() {
                continue;
            }

            let ok = check_backend(&inner.factory, shard.backend(), &inner.log);
            inner.mark_available(shard, ok);
        }
    }
    info!(inner.log, "health check thread exiting");
}

// Probe a backend by re-dialing it with short timeouts. The probe
// connection is discarded as soon as the dial resolves.
fn check_backend<C>(
    factory: &ConnectionFactory<C>,
    backend: &Backend,
    log: &Logger,
) -> bool
where
    C: Connection,
{
    let timeouts = ConnectionTimeouts {
        connect: Duration::from_millis(PROBE_TIMEOUT),
        data: Duration::from_millis(PROBE_TIMEOUT),
    };

    for _ in 0..PROBE_ATTEMPTS {
        let mut conn = (factory)(backend, &timeouts);
        match conn.connect() {
            Ok(()) => return true,
            Err(e) => {
                debug!(log, "health probe failed for {}: {}", backend, e);
            }
        }
    }
    false
}
