//! End-to-end scenarios seeded with literal values, one per named case.
//!
//! Exercises the public `Message`/`FloodRouter`/`ConnectionPool`/
//! `RateLimiter` surface the way the Supervisor composes them, rather than
//! any single module in isolation. The adaptive-scan-escalation scenario is
//! covered inline in `src/ble/discovery.rs` instead, since its scan loop is
//! driven through a private method not reachable from outside the crate.

use std::sync::Arc;
use std::time::Instant;

use beacon::ble::ConnectionPool;
use beacon::config::Config;
use beacon::device::{DeviceInfo, Priority};
use beacon::handler::MessageHandler;
use beacon::rate_limiter::RateLimiter;
use beacon::router::FloodRouter;
use beacon::sanitizer::Sanitizer;

fn handler_for(node: &str, config: Arc<Config>) -> MessageHandler {
    let sanitizer = Arc::new(Sanitizer::new());
    let router = Arc::new(FloodRouter::new(node.to_string(), config.message_cache_size, config.message_cache_ttl));
    let rate_limiter = Arc::new(RateLimiter::new(&config));
    MessageHandler::new(config, sanitizer, router, rate_limiter)
}

/// Scenario 1: dedup across two paths.
#[test]
fn dedup_across_two_delivery_paths() {
    let config = Arc::new(Config::default());
    let a = handler_for("A", config.clone());
    let m = a.create("hi", "A", None, None).unwrap();
    let bytes = m.encode();

    let b = handler_for("B", config);
    let peers = vec!["A".to_string(), "C".to_string()];

    // First delivery: via a central notification straight from A.
    let first = b.receive(&bytes, "A", &peers);
    assert!(first.delivered.is_some());

    // Second delivery of the identical datagram, relayed by C this time.
    let second = b.receive(&bytes, "C", &peers);
    assert!(second.delivered.is_none());
    assert!(second.forward_to.is_empty());
}

/// Scenario 2: TTL exhaustion along an A-B-C-D-E chain with ttl=3.
#[test]
fn ttl_exhaustion_along_chain() {
    let mut config = Config::default();
    config.message_ttl = 3;
    let config = Arc::new(config);

    let a = handler_for("A", config.clone());
    let origin = a.create("relay me", "A", None, None).unwrap();
    assert_eq!(origin.ttl, 3);

    let b = handler_for("B", config.clone());
    let at_b = b.receive(&origin.encode(), "A", &["A".to_string(), "C".to_string()]).delivered.unwrap();
    assert_eq!(at_b.ttl, 3); // route() doesn't decrement ttl; prepare_forward does.
    let to_c = b.prepare_forward(&at_b).expect("ttl > 0");

    let c = handler_for("C", config.clone());
    let at_c = c.receive(&to_c, "B", &["B".to_string(), "D".to_string()]).delivered.unwrap();
    let to_d = c.prepare_forward(&at_c).expect("ttl > 0");

    let d = handler_for("D", config.clone());
    let at_d = d.receive(&to_d, "C", &["C".to_string(), "E".to_string()]).delivered.unwrap();
    let to_e = d.prepare_forward(&at_d).expect("ttl > 0");

    let e = handler_for("E", config);
    let outcome = e.receive(&to_e, "D", &["D".to_string(), "F".to_string()]);
    let delivered = outcome.delivered.expect("E processes locally even at ttl=0");
    assert_eq!(delivered.ttl, 0);
    assert!(outcome.forward_to.is_empty());

    // Any further relay attempt finds ttl already exhausted.
    assert!(e.prepare_forward(&delivered).is_none());
}

/// Scenario 3: loop prevention on a triangle graph A-B, B-C, C-A.
#[test]
fn loop_prevention_on_triangle() {
    let config = Arc::new(Config::default());

    let a = handler_for("A", config.clone());
    let origin = a.create("mesh loop check", "A", None, None).unwrap();

    let b = handler_for("B", config.clone());
    let at_b = b.receive(&origin.encode(), "A", &["A".to_string(), "C".to_string()]);
    let delivered_at_b = at_b.delivered.expect("B should process the originated message");
    let forward_bytes = b.prepare_forward(&delivered_at_b).expect("fresh message with ttl > 0 forwards");

    let c = handler_for("C", config.clone());
    let at_c = c.receive(&forward_bytes, "B", &["A".to_string(), "B".to_string()]);
    assert!(at_c.delivered.is_some(), "C sees this message for the first time");

    // C tries to relay to A, but A's own id is already in seen_by (A originated it).
    let delivered_at_c = at_c.delivered.unwrap();
    let relay_to_a = c.prepare_forward(&delivered_at_c).unwrap();
    let a_again = a.receive(&relay_to_a, "C", &["B".to_string(), "C".to_string()]);
    assert!(a_again.delivered.is_none(), "A must drop a message that already carries A in seen_by");
}

/// Scenario 5: pool eviction by priority, literal health scores from the example walkthrough.
#[test]
fn pool_eviction_picks_worst_health_among_same_priority() {
    let mut config = Config::default();
    config.max_concurrent_connections = 4;
    let pool = ConnectionPool::new(Arc::new(config));
    let now = Instant::now();

    let scores = [("P1", 0.9_f32), ("P2", 0.7), ("P3", 0.4), ("P4", 0.8)];
    for (addr, score) in scores {
        let mut device = DeviceInfo::new(addr, "peer", -40, now);
        device.health_score = score;
        pool.add(addr, device, Priority::Normal, now).unwrap();
    }
    assert_eq!(pool.connection_count(), 4);

    let mut incoming = DeviceInfo::new("X", "high-priority-peer", -30, now);
    incoming.health_score = 1.0;
    pool.add("X", incoming, Priority::High, now).unwrap();

    assert!(pool.is_connected("X"));
    assert!(!pool.is_connected("P3"), "the 0.4-health peer should have been evicted");
    assert!(pool.is_connected("P1"));
    assert!(pool.is_connected("P2"));
    assert!(pool.is_connected("P4"));
}

/// Scenario 6: rate limit surfacing with a literal per-connection cap of 10.
#[test]
fn rate_limit_surfaces_on_eleventh_originate() {
    let mut config = Config::default();
    config.rate_limit_per_connection = 10;
    config.rate_limit_per_device = 1000;
    config.rate_limit_global = 1000;
    let config = Arc::new(config);
    let h = handler_for("local-node", config);

    for i in 0..10 {
        h.create(&format!("message {i}"), "local-node", None, Some("conn-1")).expect("within cap");
    }

    let err = h.create("eleventh", "local-node", None, Some("conn-1")).unwrap_err();
    match err {
        beacon::error::BeaconError::RateLimit(e) => {
            assert_eq!(e.limit_type, beacon::error::LimitType::Connection);
            assert!(e.retry_after_secs <= 60);
        }
        other => panic!("expected RateLimit error, got {other:?}"),
    }
    // The rejected attempt must not have been enqueued.
    assert_eq!(h.recent_messages().len(), 10);
}
