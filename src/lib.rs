pub mod ble;
pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod message;
pub mod rate_limiter;
pub mod router;
pub mod sanitizer;
pub mod supervisor;
