//! Integration tests for the session pool

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mysql_native::{Error, Pool, PoolRegistry, PoolStats, SessionState};
use pretty_assertions::assert_eq;

use common::{MockConfig, MockServer, echo_handler, silent_server};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_pool_reuses_most_recent_session() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let registry = PoolRegistry::new();
    let opts = server.opts();

    let first = registry.acquire(&opts, TIMEOUT).expect("acquire 1");
    let second = registry.acquire(&opts, TIMEOUT).expect("acquire 2");
    let (first_id, second_id) = (first.id(), second.id());
    assert_ne!(first_id, second_id);

    let pool = Arc::clone(first.pool());
    assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 2 });
    drop(first);
    drop(second);
    assert_eq!(pool.stats(), PoolStats { idle: 2, in_use: 0 });

    // last released, first handed out
    let again = registry.acquire(&opts, TIMEOUT).expect("acquire 3");
    assert_eq!(again.id(), second_id);
    assert_eq!(again.state(), SessionState::Ready);
    assert_eq!(pool.stats(), PoolStats { idle: 1, in_use: 1 });

    // the reused session was pinged and reset
    assert_eq!(server.count("PING"), 1);
    assert_eq!(server.count("CHANGE_USER game"), 1);
    assert_eq!(server.connections(), 2);
}

#[test]
fn test_registry_keys_by_descriptor() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let registry = PoolRegistry::new();

    let opts = server.opts();
    let mut resized = opts.clone();
    resized.pool_max_size = 3;
    let mut other_db = opts.clone();
    other_db.db = Some("archive".to_string());

    let a = registry.pool(&opts).expect("pool");
    let b = registry.pool(&resized).expect("pool");
    let c = registry.pool(&other_db).expect("pool");
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(a.opts().pool_max_size, 3);
}

#[test]
fn test_pool_min_size_prefill() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let registry = PoolRegistry::new();
    let mut opts = server.opts();
    opts.pool_min_size = 2;

    let pool = registry.pool(&opts).expect("pool");
    assert_eq!(pool.stats(), PoolStats { idle: 2, in_use: 0 });

    let session = pool.acquire(TIMEOUT).expect("acquire");
    assert_eq!(pool.stats(), PoolStats { idle: 1, in_use: 1 });
    drop(session);
    assert_eq!(pool.stats(), PoolStats { idle: 2, in_use: 0 });
    assert_eq!(server.connections(), 2);
}

#[test]
fn test_pool_timeout_when_saturated() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let mut opts = server.opts();
    opts.pool_max_size = 1;
    let pool = Arc::new(Pool::new(opts));

    let held = pool.acquire(TIMEOUT).expect("acquire");
    let timeout = Duration::from_millis(200);
    let started = Instant::now();
    match pool.acquire(timeout) {
        Err(Error::PoolTimeout(waited)) => assert_eq!(waited, timeout),
        Err(err) => panic!("expected a pool timeout, got {err:?}"),
        Ok(_) => panic!("pool handed out a second session"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(2));

    drop(held);
    pool.acquire(timeout).expect("acquire after release");
}

#[test]
fn test_pool_waits_for_release() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let mut opts = server.opts();
    opts.pool_max_size = 1;
    let pool = Arc::new(Pool::new(opts));

    let held = pool.acquire(TIMEOUT).expect("acquire");
    let held_id = held.id();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        drop(held);
    });

    let session = pool.acquire(TIMEOUT).expect("acquire after release");
    assert_eq!(session.id(), held_id);
    releaser.join().expect("releaser thread");
}

#[test]
fn test_expired_session_is_not_reused() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let mut opts = server.opts();
    opts.pool_lifetime = Some(Duration::from_millis(50));
    let pool = Arc::new(Pool::new(opts));

    let session = pool.acquire(TIMEOUT).expect("acquire");
    let expired_id = session.id();
    thread::sleep(Duration::from_millis(100));
    drop(session);
    assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 0 });
    assert!(server.wait_for("QUIT", 1));

    let fresh = pool.acquire(TIMEOUT).expect("acquire");
    assert_ne!(fresh.id(), expired_id);
    assert_eq!(server.connections(), 2);
}

#[test]
fn test_dead_idle_session_is_discarded() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let pool = Arc::new(Pool::new(server.opts()));

    let session = pool.acquire(TIMEOUT).expect("acquire");
    let dead_id = session.id();
    drop(session);
    assert_eq!(pool.stats().idle, 1);

    server.kill_connections();
    let mut fresh = pool.acquire(TIMEOUT).expect("acquire");
    assert_ne!(fresh.id(), dead_id);
    assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 1 });
    fresh.query_drop("DO 1").expect("fresh session works");
}

#[test]
fn test_failed_session_is_not_returned() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let mut opts = server.opts();
    opts.pool_max_size = 1;
    let pool = Arc::new(Pool::new(opts));

    let mut session = pool.acquire(TIMEOUT).expect("acquire");
    server.kill_connections();
    assert!(!session.ping().expect("ping"));
    assert_eq!(session.state(), SessionState::Failed);

    // the dead member is swept from the in-use set, making room for a new session
    let mut replacement = pool.acquire(TIMEOUT).expect("acquire replacement");
    assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 1 });
    drop(session);
    assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 1 });
    replacement.query_drop("DO 1").expect("replacement works");
}

#[test]
fn test_abandoned_result_is_drained_on_release() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let pool = Arc::new(Pool::new(server.opts()));

    let mut session = pool.acquire(TIMEOUT).expect("acquire");
    drop(session.query("SELECT 1; SELECT 2").expect("query"));
    assert_eq!(session.state(), SessionState::Busy);
    drop(session);

    assert_eq!(pool.stats(), PoolStats { idle: 1, in_use: 0 });
    let mut session = pool.acquire(TIMEOUT).expect("acquire");
    assert_eq!(session.query_drop("DO 1").expect("query"), 0);
}

#[test]
fn test_concurrent_acquire_never_shares_a_session() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let mut opts = server.opts();
    opts.pool_max_size = 4;
    let pool = Arc::new(Pool::new(opts));
    let checked_out = Arc::new(Mutex::new(HashSet::new()));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let checked_out = Arc::clone(&checked_out);
            thread::spawn(move || {
                for _ in 0..10 {
                    let mut session = pool.acquire(TIMEOUT).expect("acquire");
                    assert!(
                        checked_out.lock().unwrap().insert(session.id()),
                        "session handed out twice"
                    );
                    session.query_drop("SELECT 1").expect("query");
                    checked_out.lock().unwrap().remove(&session.id());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker thread");
    }
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle <= 4);
    assert!(server.connections() <= 4);
}

#[test]
fn test_acquire_gives_up_on_silent_server() {
    let (_listener, opts) = silent_server();
    let pool = Arc::new(Pool::new(opts));

    let timeout = Duration::from_millis(200);
    let started = Instant::now();
    match pool.acquire(timeout) {
        Err(Error::PoolTimeout(waited)) => assert_eq!(waited, timeout),
        Err(err) => panic!("expected a pool timeout, got {err:?}"),
        Ok(_) => panic!("a silent server produced a session"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(pool.stats(), PoolStats::default());
}

#[test]
fn test_stalled_pool_does_not_block_registry() {
    let server = MockServer::start(MockConfig::new(echo_handler));
    let (_listener, mut stalled) = silent_server();
    stalled.pool_min_size = 1;
    stalled.connect_timeout = Duration::from_secs(2);
    let registry = Arc::new(PoolRegistry::new());

    let filler = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.pool(&stalled).map(|_| ()))
    };
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let session = registry
        .acquire(&server.opts(), Duration::from_millis(500))
        .expect("acquire for a healthy server");
    assert!(started.elapsed() < Duration::from_secs(1));
    drop(session);

    let filled = filler.join().expect("filler thread");
    assert!(matches!(filled, Err(ref err) if err.is_io_timeout()));
}
