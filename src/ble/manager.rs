//! Bluetooth Manager: owns the central role — connection
//! lifecycle, characteristic writes, heartbeat, and stale-connection
//! cleanup.
//!
//! Connect, send, heartbeat, and cleanup all run over the `BleCentral`
//! driver trait, with shared state held behind a single
//! `std::sync::Mutex` critical section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{info, warn};
use uuid::Uuid;

use crate::ble::driver::{BleCentral, PeerLink};
use crate::config::Config;
use crate::device::{ConnectionState, DeviceInfo};
use crate::error::BluetoothError;

struct Link {
    device: DeviceInfo,
    peer: Option<PeerLink>,
}

struct Inner {
    links: HashMap<String, Link>,
}

pub struct Manager {
    config: Arc<Config>,
    central: Arc<dyn BleCentral>,
    local_address: String,
    inner: Mutex<Inner>,
    running: AtomicBool,
    on_message_received: Mutex<Option<Box<dyn Fn(&str, Vec<u8>) + Send + Sync>>>,
    on_device_connected: Mutex<Option<Box<dyn Fn(&DeviceInfo) + Send + Sync>>>,
    on_device_disconnected: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl Manager {
    pub fn new(config: Arc<Config>, central: Arc<dyn BleCentral>) -> Arc<Self> {
        Arc::new(Self {
            config,
            central,
            local_address: derive_local_address(),
            inner: Mutex::new(Inner { links: HashMap::new() }),
            running: AtomicBool::new(true),
            on_message_received: Mutex::new(None),
            on_device_connected: Mutex::new(None),
            on_device_disconnected: Mutex::new(None),
        })
    }

    pub fn set_on_message_received(&self, f: impl Fn(&str, Vec<u8>) + Send + Sync + 'static) {
        *self.on_message_received.lock().expect("manager callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_device_connected(&self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        *self.on_device_connected.lock().expect("manager callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_device_disconnected(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_device_disconnected.lock().expect("manager callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.inner
            .lock()
            .expect("manager mutex poisoned")
            .links
            .get(address)
            .map(|l| l.device.state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .lock()
            .expect("manager mutex poisoned")
            .links
            .values()
            .filter(|l| l.device.state == ConnectionState::Connected)
            .count()
    }

    pub fn connected_addresses(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("manager mutex poisoned")
            .links
            .iter()
            .filter(|(_, l)| l.device.state == ConnectionState::Connected)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// `connect(address)` `known_device` is the device record
    /// Discovery already holds, if any; a fresh one is created otherwise.
    pub async fn connect(self: &Arc<Self>, address: &str, known_device: Option<DeviceInfo>) -> Result<bool, BluetoothError> {
        {
            let inner = self.inner.lock().expect("manager mutex poisoned");
            if let Some(link) = inner.links.get(address) {
                if link.device.state == ConnectionState::Connected {
                    return Ok(true);
                }
            }
            let active = inner.links.values().filter(|l| l.device.state == ConnectionState::Connected).count();
            if active >= self.config.max_concurrent_connections {
                return Ok(false);
            }
        }

        let now = Instant::now();
        {
            let mut inner = self.inner.lock().expect("manager mutex poisoned");
            let link = inner.links.entry(address.to_string()).or_insert_with(|| Link {
                device: known_device.clone().unwrap_or_else(|| DeviceInfo::new(address, "", 0, now)),
                peer: None,
            });
            link.device.state = ConnectionState::Connecting;
            link.device.connection_attempts += 1;
        }

        let this = self.clone();
        let notify_addr = address.to_string();
        let on_notify: Box<dyn Fn(Vec<u8>) + Send + Sync> = Box::new(move |bytes| {
            this.handle_notification(&notify_addr, bytes);
        });

        let this_disc = self.clone();
        let disc_addr = address.to_string();
        let on_disconnect: Box<dyn Fn() + Send + Sync> = Box::new(move || {
            this_disc.handle_unexpected_disconnect(&disc_addr);
        });

        let connect_result = self
            .central
            .connect(address, self.config.connection_timeout, &self.config.service_uuid, &self.config.characteristic_uuid, on_notify, on_disconnect)
            .await;

        match connect_result {
            Ok(peer) => {
                let now = Instant::now();
                let connected_device = {
                    let mut inner = self.inner.lock().expect("manager mutex poisoned");
                    let link = inner.links.get_mut(address).expect("entry inserted above");
                    link.device.state = ConnectionState::Connected;
                    link.device.record_heartbeat(now);
                    link.peer = Some(peer);
                    link.device.clone()
                };
                info!("connected to {address}");
                if let Some(cb) = self.on_device_connected.lock().expect("manager callback mutex poisoned").as_ref() {
                    cb(&connected_device);
                }
                Ok(true)
            }
            Err(e) => {
                let penalty = match &e {
                    BluetoothError::ConnectTimeout { .. } => 0.2,
                    _ => 0.3,
                };
                let mut inner = self.inner.lock().expect("manager mutex poisoned");
                if let Some(link) = inner.links.get_mut(address) {
                    link.device.state = ConnectionState::Error;
                    link.device.decay_health(penalty);
                }
                drop(inner);
                warn!("connect to {address} failed: {e}");
                Err(e)
            }
        }
    }

    /// Retry `connect` up to `MAX_RECONNECT_ATTEMPTS` times, sleeping
    /// `RECONNECT_DELAY` between attempts, giving up on the first
    /// non-error refusal (pool genuinely full) rather than retrying it.
    pub async fn connect_with_retry(self: &Arc<Self>, address: &str, known_device: Option<DeviceInfo>) -> Result<bool, BluetoothError> {
        let mut last_err = None;
        for attempt in 1..=self.config.max_reconnect_attempts {
            match self.connect(address, known_device.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!("connect attempt {attempt}/{} to {address} failed: {e}", self.config.max_reconnect_attempts);
                    last_err = Some(e);
                    if attempt < self.config.max_reconnect_attempts {
                        tokio::time::sleep(self.config.reconnect_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(BluetoothError::ConnectFailure { address: address.to_string(), reason: "exhausted retries".to_string() }))
    }

    /// `disconnect(address)`, idempotent.
    pub async fn disconnect(&self, address: &str) -> Result<(), BluetoothError> {
        let peer = {
            let mut inner = self.inner.lock().expect("manager mutex poisoned");
            let Some(link) = inner.links.get_mut(address) else {
                return Ok(());
            };
            link.device.state = ConnectionState::Disconnecting;
            link.peer.take()
        };

        if let Some(peer) = &peer {
            let _ = self.central.disconnect(peer).await;
        }

        self.inner.lock().expect("manager mutex poisoned").links.remove(address);
        if let Some(cb) = self.on_device_disconnected.lock().expect("manager callback mutex poisoned").as_ref() {
            cb(address);
        }
        Ok(())
    }

    /// `send(address, bytes)`: prefers write-without-response.
    pub async fn send(&self, address: &str, bytes: Vec<u8>) -> Result<(), BluetoothError> {
        let fut = {
            let inner = self.inner.lock().expect("manager mutex poisoned");
            let link = inner.links.get(address).ok_or_else(|| BluetoothError::WriteFailure {
                address: address.to_string(),
                reason: "not connected".to_string(),
            })?;
            let peer = link.peer.as_ref().ok_or_else(|| BluetoothError::WriteFailure {
                address: address.to_string(),
                reason: "not connected".to_string(),
            })?;
            (peer.write)(bytes, peer.supports_write_without_response)
        };

        let result = fut.await;
        if result.is_err() {
            let mut inner = self.inner.lock().expect("manager mutex poisoned");
            if let Some(link) = inner.links.get_mut(address) {
                link.device.decay_health(0.1);
            }
        }
        result
    }

    /// Spawns the heartbeat and cleanup background loops.
    /// Returns both join handles so the Supervisor can abort them on shutdown.
    pub fn start(self: &Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        self.running.store(true, Ordering::SeqCst);
        (self.clone().spawn_heartbeat_loop(), self.clone().spawn_cleanup_loop())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(self.config.heartbeat_interval).await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.broadcast_heartbeat().await;
            }
        })
    }

    fn spawn_cleanup_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.run_cleanup().await;
            }
        })
    }

    async fn broadcast_heartbeat(&self) {
        let targets = self.connected_addresses();
        let payload = heartbeat_payload(&self.local_address);
        for address in targets {
            if let Err(e) = self.send(&address, payload.clone()).await {
                warn!("heartbeat to {address} failed: {e}");
            }
        }
    }

    /// Cleanup loop body, split out so tests can drive one pass
    /// without waiting on the real 30 s interval.
    pub async fn run_cleanup(&self) {
        let now = Instant::now();
        let stale: Vec<String> = {
            let mut inner = self.inner.lock().expect("manager mutex poisoned");
            let mut stale = Vec::new();
            for (address, link) in inner.links.iter_mut() {
                let since_heartbeat = now.saturating_duration_since(link.device.last_heartbeat);
                if since_heartbeat > self.config.heartbeat_timeout {
                    link.device.decay_health(0.3);
                    stale.push(address.clone());
                } else if link.device.health_score < self.config.health_score_critical {
                    stale.push(address.clone());
                }
            }
            stale
        };

        for address in stale {
            if let Err(e) = self.disconnect(&address).await {
                warn!("cleanup disconnect of {address} failed: {e}");
            }
        }
    }

    fn handle_notification(&self, address: &str, bytes: Vec<u8>) {
        {
            let mut inner = self.inner.lock().expect("manager mutex poisoned");
            if let Some(link) = inner.links.get_mut(address) {
                link.device.record_heartbeat(Instant::now());
            }
        }
        if let Some(cb) = self.on_message_received.lock().expect("manager callback mutex poisoned").as_ref() {
            cb(address, bytes);
        }
    }

    fn handle_unexpected_disconnect(&self, address: &str) {
        let existed = {
            let mut inner = self.inner.lock().expect("manager mutex poisoned");
            if let Some(link) = inner.links.get_mut(address) {
                link.device.decay_health(0.2);
            }
            inner.links.remove(address).is_some()
        };
        if existed {
            warn!("unexpected disconnect from {address}");
            if let Some(cb) = self.on_device_disconnected.lock().expect("manager callback mutex poisoned").as_ref() {
                cb(address);
            }
        }
    }
}

/// A heartbeat's wire payload: `type: heartbeat`, `ttl: 1`, never
/// forwarded past the directly-connected peer.
fn heartbeat_payload(local_address: &str) -> Vec<u8> {
    let message = serde_json::json!({
        "message_id": Uuid::new_v4().to_string(),
        "sender_id": local_address,
        "content": "",
        "timestamp": std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64(),
        "ttl": 1,
        "seen_by": [local_address],
        "type": "heartbeat",
    });
    serde_json::to_vec(&message).unwrap_or_default()
}

/// Stable local identifier, derived once at startup since this device has no
/// other durable identity. Mirrors `manager.py`'s
/// `str(uuid.uuid4())[:17].replace("-", ":")`.
fn derive_local_address() -> String {
    Uuid::new_v4().to_string()[..17].replace('-', ":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockCentral;

    fn manager_with(central: Arc<MockCentral>) -> Arc<Manager> {
        Manager::new(Arc::new(Config::default()), central)
    }

    #[tokio::test]
    async fn connect_is_idempotent_when_already_connected() {
        let manager = manager_with(Arc::new(MockCentral::new()));
        assert!(manager.connect("AA:BB", None).await.unwrap());
        assert!(manager.connect("AA:BB", None).await.unwrap());
        assert_eq!(manager.connected_count(), 1);
    }

    #[tokio::test]
    async fn connect_refuses_at_capacity() {
        let mut config = Config::default();
        config.max_concurrent_connections = 1;
        let manager = Manager::new(Arc::new(config), Arc::new(MockCentral::new()));
        assert!(manager.connect("AA:BB", None).await.unwrap());
        assert!(!manager.connect("CC:DD", None).await.unwrap());
    }

    #[tokio::test]
    async fn connect_failure_decays_health_and_propagates_error() {
        let central = Arc::new(MockCentral::new());
        *central.fail_connect.lock().unwrap() = Some("AA:BB".to_string());
        let manager = manager_with(central);

        let err = manager.connect("AA:BB", None).await.unwrap_err();
        assert!(matches!(err, BluetoothError::ConnectFailure { .. }));
        assert!(!manager.is_connected("AA:BB"));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let manager = manager_with(Arc::new(MockCentral::new()));
        manager.connect("AA:BB", None).await.unwrap();
        manager.disconnect("AA:BB").await.unwrap();
        manager.disconnect("AA:BB").await.unwrap();
        assert!(!manager.is_connected("AA:BB"));
    }

    #[tokio::test]
    async fn send_fails_when_not_connected() {
        let manager = manager_with(Arc::new(MockCentral::new()));
        let err = manager.send("AA:BB", b"hi".to_vec()).await.unwrap_err();
        assert!(matches!(err, BluetoothError::WriteFailure { .. }));
    }

    #[tokio::test]
    async fn cleanup_disconnects_on_heartbeat_timeout() {
        let manager = manager_with(Arc::new(MockCentral::new()));
        manager.connect("AA:BB", None).await.unwrap();
        {
            let mut inner = manager.inner.lock().unwrap();
            let link = inner.links.get_mut("AA:BB").unwrap();
            link.device.last_heartbeat = Instant::now() - (manager.config.heartbeat_timeout + std::time::Duration::from_secs(1));
        }
        manager.run_cleanup().await;
        assert!(!manager.is_connected("AA:BB"));
    }

    #[test]
    fn local_address_has_colon_separated_form() {
        let addr = derive_local_address();
        assert_eq!(addr.len(), 17);
    }
}
