// Copyright 2020 Joyent, Inc.

//! A sharded connection pool for replicated services
//!
//! Dpool manages a bounded set of reusable, pre-opened connections across a
//! list of logically equivalent backend servers, such as the members of a
//! replicated cache or database tier. Each backend gets its own *shard*: an
//! idle LIFO stack of connections plus caps on how many connections the
//! shard may hold idle (`max_idle`) and have open at once (`max_active`).
//! Requests rotate round-robin across the shards, skipping any that are out
//! of rotation, and a background health checker re-probes suspect backends
//! once a second by re-dialing them. Demotion is bounded: no more than a
//! third of the shards may be out of rotation at any time, so correlated
//! probe failures cannot empty the pool.
//!
//! Use of the pool requires an implementation of the
//! [`Connection`]: connection/trait.Connection.html trait for whatever the
//! caller considers a connection -- a TCP socket, or an application-level
//! session layered on one -- together with a factory function that builds an
//! instance of it for a given backend. The pool never looks inside a
//! connection; its only demands are that one can be dialed and dropped. A
//! stock TCP implementation is provided in the
//! [`tcp`]: tcp/index.html module.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::thread;
//!
//! use slog::{o, Drain, Logger};
//!
//! use dpool::backend::Backend;
//! use dpool::connection_pool::types::ConnectionPoolOptions;
//! use dpool::connection_pool::ConnectionPool;
//! use dpool::tcp::TcpStreamConnection;
//!
//! fn main() {
//!     let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//!     let log = Logger::root(
//!         std::sync::Mutex::new(
//!             slog_term::FullFormat::new(plain).build()
//!         ).fuse(),
//!         o!("build-id" => "0.1.0")
//!     );
//!
//!     let backends = vec![
//!         Backend::new("127.0.0.1", 6379),
//!         Backend::new("127.0.0.1", 6380),
//!         Backend::new("127.0.0.1", 6381),
//!     ];
//!
//!     let options = ConnectionPoolOptions {
//!         max_idle: Some(10),
//!         max_active: Some(100),
//!         log: Some(log.clone()),
//!         ..Default::default()
//!     };
//!
//!     let pool = ConnectionPool::new(
//!         backends,
//!         options,
//!         TcpStreamConnection::new,
//!     );
//!
//!     for _ in 0..10 {
//!         let pool = pool.clone();
//!         thread::spawn(move || {
//!             let conn = pool.get()?;
//!             // Do stuff here
//!             pool.put(conn, false);
//!         });
//!     }
//! }
//! ```

#![allow(missing_docs)]

pub mod backend;
pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod tcp;
