//! Platform BLE driver contract: the two roles a node runs
//! simultaneously. Manager drives `BleCentral`; GattServer drives
//! `BlePeripheral`. Both are `async_trait` object-safe traits so the
//! Supervisor can hold `Box<dyn ...>` without knowing which backend
//! (btleplug, bluer, or the in-memory mock) is underneath.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BluetoothError;

/// A boxed, owned future — used for the `write` callback since trait
/// objects can't name `async fn`'s anonymous return type.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One BLE advertisement observed during a scan window.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    /// Service UUIDs advertised, lower-cased, used by Discovery's app-device
    /// classification.
    pub service_uuids: Vec<String>,
    /// Service-data keys advertised, lower-cased. A peer that carries
    /// `SERVICE_UUID` as a service-data key rather than in the service-UUID
    /// list still classifies as an app device.
    pub service_data: Vec<String>,
}

/// Central-role driver: scan, connect, discover the service, write, and
/// subscribe to notifications against real hardware via `btleplug`.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Start scanning; `on_advertisement` is invoked for each advertisement
    /// seen until `stop_scan` is called. Must return within
    /// `SCANNER_START_TIMEOUT`.
    async fn start_scan(
        &self,
        on_advertisement: Box<dyn Fn(Advertisement) + Send + Sync>,
    ) -> Result<(), BluetoothError>;

    /// Stop scanning. Must return within `SCANNER_STOP_TIMEOUT`.
    async fn stop_scan(&self) -> Result<(), BluetoothError>;

    /// Connect to `address`, discover the service/characteristic, and
    /// subscribe to notifications. `on_notify` delivers each notification's
    /// raw payload. Bounded by `timeout`.
    async fn connect(
        &self,
        address: &str,
        timeout: Duration,
        service_uuid: &str,
        characteristic_uuid: &str,
        on_notify: Box<dyn Fn(Vec<u8>) + Send + Sync>,
        on_disconnect: Box<dyn Fn() + Send + Sync>,
    ) -> Result<PeerLink, BluetoothError>;

    async fn disconnect(&self, link: &PeerLink) -> Result<(), BluetoothError>;
}

/// A connected central-role peer link; opaque to callers beyond knowing
/// whether writes should prefer write-without-response.
pub struct PeerLink {
    pub address: String,
    pub supports_write_without_response: bool,
    /// `write(bytes, without_response)`; the closure owns whatever handle
    /// the backend needs and returns a future so write errors propagate
    /// instead of being swallowed in a detached task.
    pub write: Box<dyn Fn(Vec<u8>, bool) -> BoxFuture<'static, Result<(), BluetoothError>> + Send + Sync>,
}

/// Peripheral-role driver: host the single GATT characteristic contract of
/// and advertise `SERVICE_UUID`.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Advertise `service_uuid` and host `characteristic_uuid` with
    /// properties {read, write, write-without-response, notify}.
    /// `on_write` fires for every inbound write, carrying a client handle
    /// opaque to the caller. `on_read` supplies the current read-buffer
    /// value. Idempotent when already running.
    async fn start(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
        on_write: Box<dyn Fn(String, Vec<u8>) + Send + Sync>,
    ) -> Result<(), BluetoothError>;

    /// Idempotent when already stopped.
    async fn stop(&self) -> Result<(), BluetoothError>;

    /// Update the characteristic value and notify every subscribed client.
    /// Non-blocking; no per-client retry on disconnect.
    async fn notify(&self, bytes: &[u8]) -> Result<(), BluetoothError>;

    fn is_running(&self) -> bool;
}
