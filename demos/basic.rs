// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use slog::{error, info, o, Drain, Logger};

use dpool::backend::Backend;
use dpool::connection_pool::types::ConnectionPoolOptions;
use dpool::connection_pool::ConnectionPool;
use dpool::tcp::TcpStreamConnection;

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic dpool example");

    // A replicated service on three local ports
    let backends = vec![
        Backend::new("127.0.0.1", 6379),
        Backend::new("127.0.0.1", 6380),
        Backend::new("127.0.0.1", 6381),
    ];

    let options = ConnectionPoolOptions {
        max_idle: Some(4),
        max_active: Some(8),
        max_fails: Some(3),
        log: Some(log.clone()),
        ..Default::default()
    };

    let mut pool =
        ConnectionPool::new(backends, options, TcpStreamConnection::new);

    let barrier = Arc::new(Barrier::new(4));

    let mut workers = Vec::new();
    for worker_id in 0..3 {
        let pool_clone = pool.clone();
        let log_clone = log.clone();
        let barrier_clone = barrier.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..10 {
                match pool_clone.get() {
                    Ok(conn) => {
                        info!(
                            log_clone,
                            "worker {} borrowed a connection to {}",
                            worker_id,
                            conn.backend()
                        );
                        // Do some work with the connection here
                        thread::sleep(Duration::from_millis(10));
                        pool_clone.put(conn, false);
                    }
                    Err(e) => {
                        error!(log_clone, "worker {}: {}", worker_id, e);
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            barrier_clone.wait();
        }));
    }

    barrier.wait();
    for worker in workers {
        let _ = worker.join();
    }

    for stats in pool.stats() {
        info!(
            log,
            "backend {}: available: {}, active: {}, \
             gets: {}, puts: {}, dials: {}, dial failures: {}",
            stats.backend,
            stats.available,
            stats.num_active,
            stats.num_get,
            stats.num_put,
            stats.num_dial,
            stats.num_dial_fail
        );
    }

    pool.shutdown();
}
