//! Configuration surface.
//!
//! One immutable value built once at startup and handed to every component
//! as `Arc<Config>` — no process-wide singleton, ad-hoc globals are replaced
//! with this injected configuration value.

use std::env;
use std::time::Duration;

/// Default BLE service UUID (identifies an app device during scan classification).
pub const SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abcdef0";
/// Default BLE characteristic UUID (read/write/write-without-response/notify).
pub const CHARACTERISTIC_UUID: &str = "12345678-1234-5678-1234-56789abcdef1";

/// Every tunable needed to run the daemon, with its literal default.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_uuid: String,
    pub characteristic_uuid: String,

    pub max_concurrent_connections: usize,
    pub connection_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,

    pub discovery_interval_initial: Duration,
    pub discovery_interval_moderate: Duration,
    pub discovery_interval_stable: Duration,
    pub discovery_interval_no_devices: Duration,
    pub min_scan_interval: Duration,
    pub max_scan_interval: Duration,
    pub default_scan_timeout: Duration,

    pub device_lost_threshold: Duration,
    pub connection_blacklist_duration: Duration,
    pub scanner_start_timeout: Duration,
    pub scanner_stop_timeout: Duration,

    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,

    pub max_message_size: usize,
    pub max_content_length: usize,
    pub message_ttl: u8,

    pub message_cache_size: usize,
    pub message_cache_ttl: Duration,

    pub rate_limit_per_connection: u32,
    pub rate_limit_per_device: u32,
    pub rate_limit_global: u32,
    pub rate_limit_window: Duration,

    pub enable_rate_limiting: bool,
    pub enable_input_sanitization: bool,

    pub health_score_critical: f32,
    pub recent_messages_capacity: usize,

    /// Additional case-insensitive substrings to reject in `Sanitizer::validate`,
    /// beyond the built-in script-like patterns.
    pub blocked_words: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID.to_string(),
            characteristic_uuid: CHARACTERISTIC_UUID.to_string(),

            max_concurrent_connections: 4,
            connection_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(30),

            discovery_interval_initial: Duration::from_secs(5),
            discovery_interval_moderate: Duration::from_secs(15),
            discovery_interval_stable: Duration::from_secs(30),
            discovery_interval_no_devices: Duration::from_secs(10),
            min_scan_interval: Duration::from_secs(3),
            max_scan_interval: Duration::from_secs(60),
            default_scan_timeout: Duration::from_secs(10),

            device_lost_threshold: Duration::from_secs(60),
            connection_blacklist_duration: Duration::from_secs(60),
            scanner_start_timeout: Duration::from_secs(5),
            scanner_stop_timeout: Duration::from_secs(5),

            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),

            max_message_size: 500,
            max_content_length: 450,
            message_ttl: 3,

            message_cache_size: 100,
            message_cache_ttl: Duration::from_secs(300),

            rate_limit_per_connection: 10,
            rate_limit_per_device: 30,
            rate_limit_global: 100,
            rate_limit_window: Duration::from_secs(60),

            enable_rate_limiting: true,
            enable_input_sanitization: true,

            health_score_critical: 0.2,
            recent_messages_capacity: 50,

            blocked_words: Vec::new(),
        }
    }
}

impl Config {
    /// Overlay `BEACON_*` environment variables onto the defaults, rather
    /// than reading from a config file.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_usize("BEACON_MAX_CONCURRENT_CONNECTIONS") {
            cfg.max_concurrent_connections = v;
        }
        if let Some(v) = env_u64("BEACON_CONNECTION_TIMEOUT_SECS") {
            cfg.connection_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_usize("BEACON_MAX_CONTENT_LENGTH") {
            cfg.max_content_length = v;
        }
        if let Some(v) = env_usize("BEACON_MAX_MESSAGE_SIZE") {
            cfg.max_message_size = v;
        }
        if let Some(v) = env::var("BEACON_MESSAGE_TTL").ok().and_then(|s| s.parse().ok()) {
            cfg.message_ttl = v;
        }
        if let Some(v) = env_bool("BEACON_ENABLE_RATE_LIMITING") {
            cfg.enable_rate_limiting = v;
        }
        if let Some(v) = env_bool("BEACON_ENABLE_INPUT_SANITIZATION") {
            cfg.enable_input_sanitization = v;
        }
        if let Ok(words) = env::var("BEACON_BLOCKED_WORDS") {
            cfg.blocked_words = words
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|s| match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}
