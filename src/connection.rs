// Copyright 2020 Joyent, Inc.

use std::error;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;

/// A pooled connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a connection pool. A connection need not be
/// limited to a TCP socket, but could be any logical notion of a connection
/// that implements the `Connection` trait.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by the `connect` function. This is an
    /// associated type for the trait meaning each specific implementation of
    /// the `Connection` trait may choose the appropriate concrete error type
    /// to return. The only constraint applied is that the selected error type
    /// must implement the
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait
    /// from the standard library. This allows for the error to be relevant to
    /// the context of the `Connection` implementation while avoiding
    /// unnecessary type parameters or having to coerce data between
    /// incompatible error types.
    type Error: error::Error;
    /// Attempt to establish the connection to the backend the connection was
    /// created for, honoring the connect timeout the factory was handed. The
    /// pool calls this exactly once per connection, before first use; a
    /// failure is accounted against the owning shard and is never propagated
    /// to the caller. Release of the underlying transport happens when the
    /// connection is dropped, so no close operation is required.
    fn connect(&mut self) -> Result<(), Self::Error>;
}

/// The timeouts a connection factory is expected to honor: `connect` bounds
/// the dial itself and `data` bounds subsequent reads and writes. The pool
/// passes these through opaquely from the pool options, except for health
/// probes which substitute their own short timeouts.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub data: Duration,
}

/// The connection factory supplied at pool construction. Given a backend
/// address and the timeouts to honor it returns an unconnected instance of
/// the connection type; the pool then invokes
/// [`connect`](trait.Connection.html#tymethod.connect) on it. The factory is
/// shared by every shard and by the health checker thread, so it must be
/// callable concurrently.
pub type ConnectionFactory<C> =
    Arc<dyn Fn(&Backend, &ConnectionTimeouts) -> C + Send + Sync + 'static>;
