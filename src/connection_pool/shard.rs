// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use slog::{debug, warn, Logger};

use crate::backend::Backend;
use crate::connection::{Connection, ConnectionFactory, ConnectionTimeouts};
use crate::connection_pool::types::{PoolStats, ShardConfig, ShardCounters, ShardId};

// A connection owned by a shard, either sitting on the idle stack or
// borrowed by a caller. The borrowed flag is read and written only by shard
// code; the shard id is stamped when the connection is first dialed and
// never changes.
#[derive(Debug)]
pub(crate) struct PooledEntry<C> {
    pub(crate) conn: C,
    pub(crate) shard_id: ShardId,
    pub(crate) borrowed: bool,
}

// The outcome of a single shard get attempt. The pool treats everything
// other than `Conn` as a cue to rotate to the next shard.
#[derive(Debug)]
pub(crate) enum ShardGet<C> {
    Conn(PooledEntry<C>),
    Empty,
    DialFailed,
    WaitTimeout,
    Closed,
}

// The shard state guarded by the mutex: the idle stack (most recently used
// at the front), the count of open connections, and the stats counters.
#[derive(Debug)]
struct ShardCore<C> {
    idle: VecDeque<PooledEntry<C>>,
    active: u32,
    counters: ShardCounters,
}

/// The per-server sub-pool: an idle LIFO stack with an active-connection
/// cap, a consecutive-failure streak, and an availability flag maintained by
/// the pool's health checker.
pub(crate) struct PoolShard<C> {
    backend: Backend,
    id: ShardId,
    config: ShardConfig,
    factory: ConnectionFactory<C>,
    available: AtomicBool,
    fails: AtomicU32,
    closed: AtomicBool,
    core: Mutex<ShardCore<C>>,
    cv: Condvar,
    log: Logger,
}

impl<C> PoolShard<C>
where
    C: Connection,
{
    pub(crate) fn new(
        backend: Backend,
        id: ShardId,
        config: ShardConfig,
        factory: ConnectionFactory<C>,
        log: Logger,
    ) -> Self {
        PoolShard {
            backend,
            id,
            config,
            factory,
            available: AtomicBool::new(true),
            fails: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            core: Mutex::new(ShardCore {
                idle: VecDeque::with_capacity(config.max_idle),
                active: 0,
                counters: ShardCounters::default(),
            }),
            cv: Condvar::new(),
            log,
        }
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    // Hand out a connection: the most recently idled one if there is one, a
    // freshly dialed one if the shard is under its cap, and otherwise
    // nothing (or, in wait mode, whatever gets returned before the wait
    // deadline). The dial itself runs outside the mutex; `active` is
    // reserved before the lock is released and rolled back if the dial
    // fails, which bounds in-flight dials without serializing them.
    pub(crate) fn get(&self) -> ShardGet<C> {
        let start = Instant::now();
        let deadline = start + self.config.max_wait;

        let mut core = self.core.lock().unwrap();
        core.counters.num_get += 1;

        loop {
            if let Some(mut entry) = core.idle.pop_front() {
                entry.borrowed = true;
                drop(core);
                return ShardGet::Conn(entry);
            }

            if self.closed.load(Ordering::Relaxed) {
                drop(core);
                warn!(self.log, "get on closed pool shard {}", self.backend);
                return ShardGet::Closed;
            }

            if self.config.max_active == 0 || core.active < self.config.max_active {
                core.active += 1;
                core.counters.num_dial += 1;
                drop(core);

                let timeouts = ConnectionTimeouts {
                    connect: self.config.connect_timeout,
                    data: self.config.data_timeout,
                };
                let mut conn = (self.factory)(&self.backend, &timeouts);
                match conn.connect() {
                    Ok(()) => {
                        self.fails.store(0, Ordering::Relaxed);
                        return ShardGet::Conn(PooledEntry {
                            conn,
                            shard_id: self.id,
                            borrowed: true,
                        });
                    }
                    Err(e) => {
                        self.fails.fetch_add(1, Ordering::Relaxed);
                        let mut core = self.core.lock().unwrap();
                        core.active -= 1;
                        core.counters.num_dial_fail += 1;
                        drop(core);
                        self.cv.notify_one();
                        warn!(
                            self.log,
                            "failed to dial {} on pool shard: {}",
                            self.backend,
                            e
                        );
                        return ShardGet::DialFailed;
                    }
                }
            }

            debug!(
                self.log,
                "pool shard for {} at capacity, active: {}",
                self.backend,
                core.active
            );

            if !self.config.wait {
                drop(core);
                return ShardGet::Empty;
            }

            let now = Instant::now();
            if now >= deadline {
                drop(core);
                warn!(
                    self.log,
                    "timed out waiting for idle connection on pool shard {}",
                    self.backend
                );
                return ShardGet::WaitTimeout;
            }
            let wait_result =
                self.cv.wait_timeout(core, deadline - now).unwrap();
            core = wait_result.0;
            if wait_result.1.timed_out() {
                drop(core);
                warn!(
                    self.log,
                    "timed out waiting for idle connection on pool shard {}",
                    self.backend
                );
                return ShardGet::WaitTimeout;
            }
        }
    }

    // Take a connection back. A non-broken return onto an open shard goes to
    // the front of the idle stack, evicting from the back if that pushes the
    // stack over `max_idle`; anything else (broken, or the shard is closed)
    // is disposed of. Disposal drops the connection after the mutex is
    // released.
    pub(crate) fn put(&self, mut entry: PooledEntry<C>, broken: bool) {
        let mut core = self.core.lock().unwrap();

        core.counters.num_put += 1;

        if !entry.borrowed {
            // Double return: the entry was never handed out, so it is not
            // part of the shard's accounting. Drop it silently.
            return;
        }
        entry.borrowed = false;

        if broken {
            self.fails.fetch_add(1, Ordering::Relaxed);
            core.counters.num_broken += 1;
        } else {
            self.fails.store(0, Ordering::Relaxed);
        }

        let mut disposable = None;
        if !self.closed.load(Ordering::Relaxed) && !broken {
            core.idle.push_front(entry);
            if core.idle.len() > self.config.max_idle {
                disposable = core.idle.pop_back();
                core.counters.num_evict += 1;
            }
        } else {
            disposable = Some(entry);
        }

        match disposable {
            Some(victim) => {
                core.active -= 1;
                core.counters.num_close += 1;
                drop(core);
                self.cv.notify_one();
                drop(victim);
            }
            None => {
                drop(core);
                self.cv.notify_one();
            }
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub(crate) fn is_suspectable(&self) -> bool {
        self.fails.load(Ordering::Relaxed) >= self.config.max_fails
    }

    // Flip the availability flag. Returns true if the underlying value
    // actually changed, so the pool can keep its available count and edge
    // logging in step.
    pub(crate) fn mark_available(&self, avail: bool) -> bool {
        self.available
            .compare_exchange(!avail, avail, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(self.log, "pool shard for {} already closed", self.backend);
            return;
        }
        self.empty();
    }

    // Drain the idle stack, accounting each connection as closed. The
    // drained connections are dropped after the mutex is released.
    fn empty(&self) {
        let mut core = self.core.lock().unwrap();
        let mut drained = Vec::with_capacity(core.idle.len());
        while let Some(entry) = core.idle.pop_front() {
            core.active -= 1;
            core.counters.num_close += 1;
            drained.push(entry);
        }
        drop(core);
        for _ in &drained {
            self.cv.notify_one();
        }
    }

    // Snapshot this shard's stats. The counters are reset by the read;
    // `available` and `num_active` are live values.
    pub(crate) fn stats(&self) -> PoolStats {
        let available = self.available.load(Ordering::Relaxed);

        let mut core = self.core.lock().unwrap();
        let stats = PoolStats {
            backend: self.backend.clone(),
            available,
            num_active: core.active,
            num_get: core.counters.num_get,
            num_put: core.counters.num_put,
            num_dial: core.counters.num_dial,
            num_dial_fail: core.counters.num_dial_fail,
            num_broken: core.counters.num_broken,
            num_evict: core.counters.num_evict,
            num_close: core.counters.num_close,
        };
        core.counters.reset();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Error as IoError, ErrorKind};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use quickcheck::{quickcheck, TestResult};
    use slog::{o, Logger};

    #[derive(Debug)]
    struct TestConnection {
        seq: usize,
        fail_dial: bool,
        connected: bool,
    }

    impl Connection for TestConnection {
        type Error = IoError;

        fn connect(&mut self) -> Result<(), IoError> {
            if self.fail_dial {
                return Err(IoError::new(
                    ErrorKind::ConnectionRefused,
                    "connection refused",
                ));
            }
            self.connected = true;
            Ok(())
        }
    }

    fn test_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn test_config(max_idle: usize, max_active: u32, max_fails: u32) -> ShardConfig {
        ShardConfig {
            max_idle,
            max_active,
            max_fails,
            connect_timeout: Duration::from_millis(100),
            data_timeout: Duration::from_millis(100),
            wait: false,
            max_wait: Duration::from_millis(3),
        }
    }

    fn test_shard(config: ShardConfig) -> PoolShard<TestConnection> {
        let next_seq = Arc::new(AtomicUsize::new(0));
        let factory: ConnectionFactory<TestConnection> =
            Arc::new(move |_b: &Backend, _t: &ConnectionTimeouts| {
                TestConnection {
                    seq: next_seq.fetch_add(1, Ordering::SeqCst),
                    fail_dial: false,
                    connected: false,
                }
            });
        PoolShard::new(
            Backend::new("127.0.0.1", 55555),
            ShardId::from(0),
            config,
            factory,
            test_log(),
        )
    }

    fn failing_shard(config: ShardConfig) -> PoolShard<TestConnection> {
        let factory: ConnectionFactory<TestConnection> =
            Arc::new(|_b: &Backend, _t: &ConnectionTimeouts| TestConnection {
                seq: 0,
                fail_dial: true,
                connected: false,
            });
        PoolShard::new(
            Backend::new("127.0.0.1", 55555),
            ShardId::from(0),
            config,
            factory,
            test_log(),
        )
    }

    fn must_get(shard: &PoolShard<TestConnection>) -> PooledEntry<TestConnection> {
        match shard.get() {
            ShardGet::Conn(entry) => entry,
            other => panic!("expected a connection, got {:?}", other),
        }
    }

    #[test]
    fn get_put_round_trip_is_lifo() {
        let shard = test_shard(test_config(2, 2, 5));

        let first = must_get(&shard);
        let second = must_get(&shard);
        assert_eq!(first.seq(), 0);
        assert_eq!(second.seq(), 1);

        shard.put(first, false);
        shard.put(second, false);

        // Most recently returned comes back first
        let reclaimed = must_get(&shard);
        assert_eq!(reclaimed.seq(), 1);

        let stats = shard.stats();
        assert_eq!(stats.num_get, 3);
        assert_eq!(stats.num_put, 2);
        assert_eq!(stats.num_dial, 2);
        assert_eq!(stats.num_dial_fail, 0);
        assert_eq!(stats.num_evict, 0);
        assert_eq!(stats.num_close, 0);
        assert_eq!(stats.num_active, 2);
        assert!(stats.available);

        shard.put(reclaimed, false);
    }

    #[test]
    fn put_overflow_evicts_least_recently_used() {
        let shard = test_shard(test_config(1, 2, 5));

        let first = must_get(&shard);
        let second = must_get(&shard);

        shard.put(first, false);
        shard.put(second, false);

        let stats = shard.stats();
        assert_eq!(stats.num_evict, 1);
        assert_eq!(stats.num_close, 1);
        assert_eq!(stats.num_active, 1);

        // The survivor is the most recently returned connection
        let survivor = must_get(&shard);
        assert_eq!(survivor.seq(), 1);
    }

    #[test]
    fn broken_return_is_disposed_immediately() {
        let shard = test_shard(test_config(2, 2, 1));

        let conn = must_get(&shard);
        shard.put(conn, true);

        let stats = shard.stats();
        assert_eq!(stats.num_broken, 1);
        assert_eq!(stats.num_close, 1);
        assert_eq!(stats.num_active, 0);
        assert_eq!(shard.fails.load(Ordering::Relaxed), 1);
        assert!(shard.is_suspectable());
        assert!(shard.core.lock().unwrap().idle.is_empty());
    }

    #[test]
    fn put_unborrowed_is_a_noop() {
        let shard = test_shard(test_config(2, 2, 5));

        let entry = PooledEntry {
            conn: TestConnection {
                seq: 99,
                fail_dial: false,
                connected: true,
            },
            shard_id: ShardId::from(0),
            borrowed: false,
        };
        shard.put(entry, false);

        let stats = shard.stats();
        assert_eq!(stats.num_put, 1);
        assert_eq!(stats.num_close, 0);
        assert_eq!(stats.num_active, 0);
        assert!(shard.core.lock().unwrap().idle.is_empty());
    }

    #[test]
    fn dial_failure_rolls_back_active() {
        let shard = failing_shard(test_config(2, 2, 3));

        match shard.get() {
            ShardGet::DialFailed => (),
            other => panic!("expected DialFailed, got {:?}", other),
        }

        let stats = shard.stats();
        assert_eq!(stats.num_dial, 1);
        assert_eq!(stats.num_dial_fail, 1);
        assert_eq!(stats.num_active, 0);
        assert_eq!(shard.fails.load(Ordering::Relaxed), 1);
        assert!(!shard.is_suspectable());
    }

    #[test]
    fn successful_dial_resets_failure_streak() {
        let shard = test_shard(test_config(2, 2, 5));
        shard.fails.store(4, Ordering::Relaxed);

        let conn = must_get(&shard);
        assert_eq!(shard.fails.load(Ordering::Relaxed), 0);
        shard.put(conn, false);
    }

    #[test]
    fn get_at_capacity_returns_empty() {
        let shard = test_shard(test_config(2, 1, 5));

        let held = must_get(&shard);
        match shard.get() {
            ShardGet::Empty => (),
            other => panic!("expected Empty, got {:?}", other),
        }
        shard.put(held, false);

        let stats = shard.stats();
        assert_eq!(stats.num_get, 2);
        assert_eq!(stats.num_dial, 1);
    }

    #[test]
    fn max_active_zero_is_unbounded() {
        let shard = test_shard(test_config(4, 0, 5));

        let mut held = Vec::new();
        for _ in 0..32 {
            held.push(must_get(&shard));
        }
        assert_eq!(shard.core.lock().unwrap().active, 32);
        for conn in held {
            shard.put(conn, false);
        }
    }

    #[test]
    fn get_on_closed_shard() {
        let shard = test_shard(test_config(2, 2, 5));

        let conn = must_get(&shard);
        shard.put(conn, false);
        shard.close();

        match shard.get() {
            ShardGet::Closed => (),
            other => panic!("expected Closed, got {:?}", other),
        }

        let stats = shard.stats();
        // The drain closed the idle connection
        assert_eq!(stats.num_close, 1);
        assert_eq!(stats.num_active, 0);
    }

    #[test]
    fn put_on_closed_shard_disposes() {
        let shard = test_shard(test_config(2, 2, 5));

        let conn = must_get(&shard);
        shard.close();
        shard.put(conn, false);

        let stats = shard.stats();
        assert_eq!(stats.num_close, 1);
        assert_eq!(stats.num_active, 0);
        assert!(shard.core.lock().unwrap().idle.is_empty());
    }

    #[test]
    fn close_twice_is_idempotent() {
        let shard = test_shard(test_config(2, 2, 5));
        shard.close();
        shard.close();
        assert!(shard.closed.load(Ordering::Relaxed));
    }

    #[test]
    fn waiting_get_picks_up_a_returned_connection() {
        let mut config = test_config(2, 1, 5);
        config.wait = true;
        config.max_wait = Duration::from_millis(2000);
        let shard = Arc::new(test_shard(config));

        let held = must_get(&shard);
        let shard_clone = Arc::clone(&shard);
        let returner = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            shard_clone.put(held, false);
        });

        let reclaimed = must_get(&shard);
        assert_eq!(reclaimed.seq(), 0);
        returner.join().unwrap();
        shard.put(reclaimed, false);
    }

    #[test]
    fn waiting_get_times_out() {
        let mut config = test_config(2, 1, 5);
        config.wait = true;
        config.max_wait = Duration::from_millis(20);
        let shard = test_shard(config);

        let held = must_get(&shard);
        let start = Instant::now();
        match shard.get() {
            ShardGet::WaitTimeout => (),
            other => panic!("expected WaitTimeout, got {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
        shard.put(held, false);
    }

    impl PooledEntry<TestConnection> {
        fn seq(&self) -> usize {
            self.conn.seq
        }
    }

    quickcheck! {
        // active never exceeds the cap and the idle stack never exceeds its
        // high-water mark, for any interleaving of gets and returns
        fn caps_hold_for_any_workload(
            ops: Vec<u8>,
            max_idle_raw: u8,
            max_active_raw: u8
        ) -> TestResult {
            let max_idle = usize::from(max_idle_raw % 8) + 1;
            let max_active = u32::from(max_active_raw % 8) + 1;
            let shard = test_shard(test_config(max_idle, max_active, 5));

            let mut borrowed = Vec::new();
            for op in ops {
                match op % 3 {
                    0 => {
                        if let ShardGet::Conn(entry) = shard.get() {
                            borrowed.push(entry);
                        }
                    }
                    1 => {
                        if let Some(entry) = borrowed.pop() {
                            shard.put(entry, false);
                        }
                    }
                    _ => {
                        if let Some(entry) = borrowed.pop() {
                            shard.put(entry, true);
                        }
                    }
                }

                let core = shard.core.lock().unwrap();
                if core.active > max_active {
                    return TestResult::failed();
                }
                if core.idle.len() > max_idle {
                    return TestResult::failed();
                }
                if core.active as usize != core.idle.len() + borrowed.len() {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }

        // With no broken returns and no eviction pressure, the shard never
        // dials more connections than the peak number borrowed at once
        fn dials_bounded_by_peak_borrow(ops: Vec<bool>, cap_raw: u8) -> TestResult {
            let cap = u32::from(cap_raw % 8) + 1;
            let shard = test_shard(test_config(cap as usize, cap, 5));

            let mut borrowed = Vec::new();
            let mut peak = 0;
            for is_get in ops {
                if is_get {
                    if let ShardGet::Conn(entry) = shard.get() {
                        borrowed.push(entry);
                        peak = peak.max(borrowed.len());
                    }
                } else if let Some(entry) = borrowed.pop() {
                    shard.put(entry, false);
                }
            }

            let stats = shard.stats();
            if stats.num_dial > peak as u64 {
                return TestResult::failed();
            }
            TestResult::passed()
        }
    }
}
