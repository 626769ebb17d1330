/*
 * Copyright 2020 Joyent, Inc.
 */

use std::error;
use std::fmt;

/// The errors surfaced by the connection pool.
///
/// Dial failures are absorbed by the owning shard (accounted in its stats and
/// failure streak, never propagated) so that the cross-shard retry in
/// [`ConnectionPool::get`](../connection_pool/struct.ConnectionPool.html#method.get)
/// can mask single-server outages. Only exhaustion of every attempt crosses
/// the pool boundary.
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// Every shard attempt failed: the rotation either skipped unavailable
    /// shards or got nothing back from the ones it tried.
    Exhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Exhausted => {
                "failed to get connection after max retries".fmt(fmt)
            }
        }
    }
}

impl error::Error for Error {}
