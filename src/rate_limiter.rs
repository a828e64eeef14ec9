//! Sliding-window rate limiter.
//!
//! One critical section guards all three buckets so a check-then-record
//! pair is atomic (no two originate attempts can both observe "under the
//! cap" and both be admitted).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{LimitType, RateLimitError};

#[derive(Default)]
struct Buckets {
    connection: HashMap<String, Vec<Instant>>,
    device: HashMap<String, Vec<Instant>>,
    global: Vec<Instant>,
}

pub struct RateLimiter {
    window: Duration,
    per_connection: u32,
    per_device: u32,
    global_cap: u32,
    enabled: bool,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(config: &Config) -> Self {
        Self {
            window: config.rate_limit_window,
            per_connection: config.rate_limit_per_connection,
            per_device: config.rate_limit_per_device,
            global_cap: config.rate_limit_global,
            enabled: config.enable_rate_limiting,
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// Garbage-collects expired timestamps, checks all three caps in
    /// global -> device -> connection order, and records `now` on success.
    /// `connection_id` is optional: an originate attempt with no live
    /// connection yet (e.g. a message typed before any peer is connected)
    /// only contributes to the device/global buckets.
    pub fn check_and_record(&self, connection_id: Option<&str>, device_id: &str) -> Result<(), RateLimitError> {
        if !self.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");

        gc(&mut buckets.global, now, self.window);
        if let Some(reason) = over_cap(&buckets.global, self.global_cap, now, self.window, LimitType::Global) {
            return Err(reason);
        }

        let device_bucket = buckets.device.entry(device_id.to_string()).or_default();
        gc(device_bucket, now, self.window);
        if let Some(reason) = over_cap(device_bucket, self.per_device, now, self.window, LimitType::Device) {
            return Err(reason);
        }

        if let Some(conn_id) = connection_id {
            let conn_bucket = buckets.connection.entry(conn_id.to_string()).or_default();
            gc(conn_bucket, now, self.window);
            if let Some(reason) = over_cap(conn_bucket, self.per_connection, now, self.window, LimitType::Connection) {
                return Err(reason);
            }
        }

        buckets.global.push(now);
        buckets.device.entry(device_id.to_string()).or_default().push(now);
        if let Some(conn_id) = connection_id {
            buckets.connection.entry(conn_id.to_string()).or_default().push(now);
        }

        Ok(())
    }
}

fn gc(bucket: &mut Vec<Instant>, now: Instant, window: Duration) {
    bucket.retain(|t| now.duration_since(*t) <= window);
}

fn over_cap(bucket: &[Instant], cap: u32, now: Instant, window: Duration, limit_type: LimitType) -> Option<RateLimitError> {
    if (bucket.len() as u32) < cap {
        return None;
    }
    let oldest = bucket.iter().min().copied().unwrap_or(now);
    let retry_after = window.saturating_sub(now.duration_since(oldest));
    Some(RateLimitError { limit_type, retry_after_secs: retry_after.as_secs() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut c = Config::default();
        c.rate_limit_per_connection = 3;
        c.rate_limit_per_device = 100;
        c.rate_limit_global = 100;
        c
    }

    #[test]
    fn allows_up_to_cap_then_rejects() {
        let limiter = RateLimiter::new(&cfg());
        for _ in 0..3 {
            assert!(limiter.check_and_record(Some("conn-1"), "dev-1").is_ok());
        }
        let err = limiter.check_and_record(Some("conn-1"), "dev-1").unwrap_err();
        assert_eq!(err.limit_type, LimitType::Connection);
        assert!(err.retry_after_secs <= 60);
    }

    #[test]
    fn disabled_always_allows() {
        let mut config = cfg();
        config.enable_rate_limiting = false;
        let limiter = RateLimiter::new(&config);
        for _ in 0..50 {
            assert!(limiter.check_and_record(Some("conn-1"), "dev-1").is_ok());
        }
    }

    #[test]
    fn buckets_are_independent_per_connection() {
        let limiter = RateLimiter::new(&cfg());
        for _ in 0..3 {
            assert!(limiter.check_and_record(Some("conn-1"), "dev-1").is_ok());
        }
        // A different connection on the same device still has budget.
        assert!(limiter.check_and_record(Some("conn-2"), "dev-1").is_ok());
    }

    #[test]
    fn global_cap_beats_device_and_connection() {
        let mut config = cfg();
        config.rate_limit_global = 1;
        let limiter = RateLimiter::new(&config);
        assert!(limiter.check_and_record(Some("conn-1"), "dev-1").is_ok());
        let err = limiter.check_and_record(Some("conn-2"), "dev-2").unwrap_err();
        assert_eq!(err.limit_type, LimitType::Global);
    }
}
