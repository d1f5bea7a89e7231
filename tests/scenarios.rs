//! End-to-end scenarios exercising the public API against real sockets.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use netfabric::{
    AddressFamily, ConnectionPool, ConnectionState, Dialer, DialerOptions, DualStackListener,
    DualStackOptions, HealthManager, HealthResult, HealthStatus, MetricsSink, PoolOptions, Tag,
};
use tokio::net::TcpListener;

/// A sink that remembers every counter increment, for asserting on the
/// standardized metric names.
#[derive(Default)]
struct RecordingSink {
    counters: Mutex<HashMap<String, u64>>,
}

impl MetricsSink for RecordingSink {
    fn increment_counter(&self, name: &str, _tags: &[Tag]) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }
}

impl RecordingSink {
    fn count(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[tokio::test]
async fn racing_dial_returns_as_soon_as_a_candidate_wins() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let options = DialerOptions::builder()
        .dual_stack_options(
            DualStackOptions::builder()
                .happy_eyeballs_delay(Duration::from_millis(100))
                .build(),
        )
        .build();

    let started = std::time::Instant::now();
    let conn = Dialer::new(options).dial(&target).await.unwrap();
    // The winner connects on loopback well inside the stagger window; the
    // dial must not wait out the full Happy Eyeballs delay.
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn circuit_breaker_opens_and_recovers_through_a_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let target = format!("127.0.0.1:{}", addr.port());
    drop(listener);

    let dialer = Dialer::new(
        DialerOptions::builder()
            .max_retries(0)
            .circuit_breaker_threshold(3)
            .circuit_breaker_timeout(Duration::from_millis(200))
            .build(),
    );

    for _ in 0..3 {
        let err = dialer.dial(&target).await.unwrap_err();
        assert_eq!(err.code(), "network.refused");
    }

    // Fourth call is short-circuited without touching the network.
    let err = dialer.dial(&target).await.unwrap_err();
    assert_eq!(err.code(), "breaker.open");
    assert!(err.suggestion().is_some());

    // After the cool-down, a probe is admitted; with the target back up it
    // closes the breaker again.
    let _listener = TcpListener::bind(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let conn = dialer.dial(&target).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.close().await.unwrap();

    let again = dialer.dial(&target).await.unwrap();
    again.close().await.unwrap();
}

#[tokio::test]
async fn pool_reuses_then_evicts_idle_entries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let sink = Arc::new(RecordingSink::default());
    let pool = ConnectionPool::new(
        PoolOptions::builder()
            .max_size(2)
            .max_idle_time(Some(Duration::from_millis(100)))
            .enable_health_check(false)
            .build(),
    );
    pool.set_metrics(sink.clone());

    // Two get+put cycles reuse one entry.
    let first = pool.get(&target).await.unwrap();
    let first_id = first.id().to_string();
    pool.put(first).await.unwrap();
    let second = pool.get(&target).await.unwrap();
    assert_eq!(second.id(), first_id);
    pool.put(second).await.unwrap();
    assert!(pool.stats().reuses >= 1);

    // A get after the idle window expires the old entry and dials fresh.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let third = pool.get(&target).await.unwrap();
    assert_ne!(third.id(), first_id);
    assert!(pool.stats().expired >= 1);

    assert!(sink.count("pool_hits") >= 1);
    assert!(sink.count("pool_misses") >= 2);
    assert!(sink.count("connections_created") >= 2);
    assert!(sink.count("connections_expired") >= 1);

    pool.close().await;
}

#[tokio::test]
async fn dual_stack_listener_accepts_both_families() {
    let listener = match DualStackListener::listen(":0").await {
        Ok(listener) => listener,
        Err(_) => return,
    };
    let addresses = listener.addresses();
    if !addresses.contains_key(&AddressFamily::V6) {
        // Single-stack host; nothing to assert about parity.
        return;
    }
    assert!(addresses.contains_key(&AddressFamily::V4));
    let port = listener.local_addr().port();

    let dialer = Dialer::default();
    let v4 = dialer.dial(format!("127.0.0.1:{}", port)).await.unwrap();
    let v6 = dialer.dial(format!("[::1]:{}", port)).await.unwrap();

    let first = listener.accept().await.unwrap();
    let second = listener.accept().await.unwrap();
    let families = [first.address().family, second.address().family];
    assert!(families.contains(&AddressFamily::V4));
    assert!(families.contains(&AddressFamily::V6));

    v4.close().await.unwrap();
    v6.close().await.unwrap();
    listener.close().await;
}

#[tokio::test]
async fn echo_round_trip_through_listener_and_dialer() {
    let listener = DualStackListener::listen("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().port();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            conn.write(&buf[..n]).await.unwrap();
        }
        let stats = conn.stats();
        listener.close().await;
        stats
    });

    let conn = netfabric::dial(format!("127.0.0.1:{}", port)).await.unwrap();
    conn.write(b"echo me").await.unwrap();
    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"echo me");
    conn.close().await.unwrap();

    let server_stats = server.await.unwrap();
    assert_eq!(server_stats.bytes_read, 7);
    assert_eq!(server_stats.bytes_written, 7);

    let client_stats = conn.stats();
    assert_eq!(client_stats.bytes_written, 7);
    assert_eq!(client_stats.bytes_read, 7);
    assert_eq!(client_stats.state, ConnectionState::Closed);
}

#[cfg(feature = "rustls-tls")]
#[tokio::test]
async fn tls_handshake_failure_is_terminal() {
    use tokio::io::AsyncWriteExt;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    // A peer that talks anything but TLS.
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = socket.write_all(b"220 definitely not tls\r\n").await;
        socket
    });

    let dialer = Dialer::new(DialerOptions::builder().max_retries(3).build());
    let err = dialer
        .dial_tls(&target, netfabric::TlsOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "security.handshake_failure");
    assert!(!err.is_retryable());

    // Exactly one connection was attempted: handshake failures are not
    // retried.
    drop(server.await.unwrap());
}

#[tokio::test]
async fn pool_health_feeds_the_health_manager() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

    let pool = ConnectionPool::new(
        PoolOptions::builder().enable_health_check(false).build(),
    );
    let conn = pool.get(&target).await.unwrap();
    pool.put(conn).await.unwrap();

    let manager = HealthManager::new();
    {
        let pool = pool.clone();
        manager.register_fn("pool", move || {
            let pool = pool.clone();
            async move { pool.health_check() }
        });
    }
    manager.register_fn("static", || async {
        HealthResult::new("static", HealthStatus::Healthy, "always fine")
    });

    manager.check_all().await;
    let aggregated = manager.aggregated_health();
    assert_eq!(aggregated.status, HealthStatus::Healthy);
    assert_eq!(aggregated.total, 2);

    pool.close().await;
}
