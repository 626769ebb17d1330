// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use derive_more::{Display, From, Into};
use slog::Logger;

use crate::backend::Backend;

// Default high-water mark for a shard's idle stack
pub(crate) const DEFAULT_MAX_IDLE: usize = 10;
// Default cap on connections (idle + borrowed) per shard
pub(crate) const DEFAULT_MAX_ACTIVE: u32 = 100;
// Default failure streak that makes a shard suspectable
pub(crate) const DEFAULT_MAX_FAILS: u32 = 5;
// Default connect timeout in milliseconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT: u64 = 100;
// Default read/write timeout in milliseconds
pub(crate) const DEFAULT_DATA_TIMEOUT: u64 = 100;
// Default bound on a waiting get, in milliseconds
pub(crate) const DEFAULT_MAX_WAIT: u64 = 3;

/// The configuration options for a connection pool. This is required to
/// instantiate a new connection pool.
#[derive(Debug, Default)]
pub struct ConnectionPoolOptions {
    /// An optional high-water mark for each shard's idle stack. A `put` that
    /// pushes the stack above this evicts the least recently used idle
    /// connection. If not specified the default is 10.
    pub max_idle: Option<usize>,
    /// An optional cap on the connections a shard may have open at once, idle
    /// and borrowed combined. A value of `0` means unbounded. If not
    /// specified the default is 100.
    pub max_active: Option<u32>,
    /// An optional failure streak length at which a shard becomes eligible
    /// for health probing. If not specified the default is 5.
    pub max_fails: Option<u32>,
    /// An optional dial timeout in milliseconds, handed through to the
    /// connection factory. If not specified the default is 100.
    pub connect_timeout: Option<u64>,
    /// An optional read/write timeout in milliseconds, handed through to the
    /// connection factory. If not specified the default is 100.
    pub data_timeout: Option<u64>,
    /// Whether a `get` against a shard at its `max_active` cap should wait
    /// for a connection to be returned rather than moving on to the next
    /// shard. If not specified the default is `false`.
    pub wait: Option<bool>,
    /// An optional bound in milliseconds on how long a waiting `get` blocks
    /// for a returned connection. Only meaningful with `wait` set. If not
    /// specified the default is 3.
    pub max_wait: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

// The per-shard knobs resolved from ConnectionPoolOptions, with every
// default applied.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ShardConfig {
    pub max_idle: usize,
    pub max_active: u32,
    pub max_fails: u32,
    pub connect_timeout: Duration,
    pub data_timeout: Duration,
    pub wait: bool,
    pub max_wait: Duration,
}

impl ShardConfig {
    pub(crate) fn from_options(opts: &ConnectionPoolOptions) -> Self {
        ShardConfig {
            max_idle: opts.max_idle.unwrap_or(DEFAULT_MAX_IDLE),
            max_active: opts.max_active.unwrap_or(DEFAULT_MAX_ACTIVE),
            max_fails: opts.max_fails.unwrap_or(DEFAULT_MAX_FAILS),
            connect_timeout: Duration::from_millis(
                opts.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            ),
            data_timeout: Duration::from_millis(
                opts.data_timeout.unwrap_or(DEFAULT_DATA_TIMEOUT),
            ),
            wait: opts.wait.unwrap_or(false),
            max_wait: Duration::from_millis(
                opts.max_wait.unwrap_or(DEFAULT_MAX_WAIT),
            ),
        }
    }
}

/// A newtype wrapper around usize identifying the shard that owns a pooled
/// connection. It indexes the pool's shard vector and is stamped on a
/// connection when it is first dialed.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ShardId(usize);

/// A snapshot of one shard's activity, as returned by
/// [`ConnectionPool::stats`](../struct.ConnectionPool.html#method.stats).
///
/// `available` and `num_active` reflect the shard's state at the moment of
/// the snapshot; the counters cover the window since the previous snapshot
/// and are reset by the read.
#[derive(Clone, Debug)]
pub struct PoolStats {
    /// The backend this shard dials.
    pub backend: Backend,
    /// Whether the health checker currently believes the backend is
    /// dialable.
    pub available: bool,
    /// Connections currently open for this shard, idle and borrowed
    /// combined.
    pub num_active: u32,
    /// `get` calls routed to this shard.
    pub num_get: u64,
    /// `put` calls routed to this shard.
    pub num_put: u64,
    /// Dial attempts.
    pub num_dial: u64,
    /// Dial attempts that failed.
    pub num_dial_fail: u64,
    /// Connections returned with `broken = true`.
    pub num_broken: u64,
    /// Idle connections evicted by `put` overflow.
    pub num_evict: u64,
    /// Connections disposed of for any reason.
    pub num_close: u64,
}

// The counter half of PoolStats, accumulated under the shard mutex and
// drained on every snapshot read.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ShardCounters {
    pub num_get: u64,
    pub num_put: u64,
    pub num_dial: u64,
    pub num_dial_fail: u64,
    pub num_broken: u64,
    pub num_evict: u64,
    pub num_close: u64,
}

impl ShardCounters {
    pub(crate) fn reset(&mut self) {
        *self = ShardCounters::default();
    }
}
