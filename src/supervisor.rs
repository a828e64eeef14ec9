//! Supervisor: binds the nine other components, fans out their
//! callbacks, and coordinates start/stop.
//!
//! Components only publish events through the narrow callback setters
//! already defined on each of them; the Supervisor is the only thing that
//! holds references back across the cycle (Discovery → Manager → Pool →
//! Supervisor), so no component holds a reference to another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{error, info, warn};

use crate::ble::driver::{BleCentral, BlePeripheral};
use crate::ble::gatt_server::ServerState;
use crate::ble::{ConnectionPool, Discovery, GattServer, Manager};
use crate::config::Config;
use crate::device::{DeviceInfo, Priority};
use crate::error::BeaconError;
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::rate_limiter::RateLimiter;
use crate::router::FloodRouter;
use crate::sanitizer::Sanitizer;

type DeviceCallback = Mutex<Option<Box<dyn Fn(&DeviceInfo) + Send + Sync>>>;

pub struct Supervisor {
    config: Arc<Config>,
    handler: Arc<MessageHandler>,
    discovery: Arc<Discovery>,
    pool: Arc<ConnectionPool>,
    manager: Arc<Manager>,
    gatt_server: Arc<GattServer>,
    running: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    on_message_received: Mutex<Option<Box<dyn Fn(&Message) + Send + Sync>>>,
    // Front-end subscriptions for the remaining callbacks names.
    // Discovery/Manager/Pool's own setters are already claimed by the
    // internal wiring below (Discovery.on_app_device_found -> connect,
    // Manager.on_device_connected -> Pool.add, etc.), so the Supervisor
    // holds a second, front-end-facing slot for each and calls both.
    on_device_found: DeviceCallback,
    on_app_device_found: DeviceCallback,
    on_device_lost: DeviceCallback,
    on_device_connected: DeviceCallback,
    on_device_disconnected: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    on_health_changed: Mutex<Option<Box<dyn Fn(&str, f32) + Send + Sync>>>,
}

impl Supervisor {
    /// Bootstraps components 1 -> 9 (Sanitizer through Bluetooth Manager)
    /// and wires their callbacks. The caller supplies the
    /// platform BLE backends so tests can pass `MockCentral`/`MockPeripheral`
    /// in place of `BtleplugCentral`/`BluezPeripheral`.
    pub fn new(config: Arc<Config>, central: Arc<dyn BleCentral>, peripheral: Arc<dyn BlePeripheral>) -> Arc<Self> {
        // The Manager derives the node's one stable local id;
        // the Router must use that same id for its `sender_id`/`seen_by`
        // bookkeeping, so it is built here rather than earlier.
        let manager = Manager::new(config.clone(), central.clone());
        let local_id = manager.local_address().to_string();

        let sanitizer = Arc::new(Sanitizer::new());
        let router = Arc::new(FloodRouter::new(local_id, config.message_cache_size, config.message_cache_ttl));
        let rate_limiter = Arc::new(RateLimiter::new(&config));
        let handler = Arc::new(MessageHandler::new(config.clone(), sanitizer, router, rate_limiter));

        let discovery = Discovery::new(config.clone(), central);
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        let gatt_server = GattServer::new(config.clone(), peripheral);

        let supervisor = Arc::new(Self {
            config,
            handler,
            discovery,
            pool,
            manager,
            gatt_server,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            on_message_received: Mutex::new(None),
            on_device_found: Mutex::new(None),
            on_app_device_found: Mutex::new(None),
            on_device_lost: Mutex::new(None),
            on_device_connected: Mutex::new(None),
            on_device_disconnected: Mutex::new(None),
            on_health_changed: Mutex::new(None),
        });
        supervisor.wire_callbacks();
        supervisor
    }

    pub fn set_on_message_received(&self, f: impl Fn(&Message) + Send + Sync + 'static) {
        *self.on_message_received.lock().expect("supervisor callback mutex poisoned") = Some(Box::new(f));
    }

    /// Front-end callback surface. Discovery/Manager/Pool's own
    /// callback setters already carry the internal wiring below, so these
    /// register a second, front-end-only subscriber that fires alongside it.
    pub fn set_on_device_found(&self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        *self.on_device_found.lock().expect("supervisor callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_app_device_found(&self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        *self.on_app_device_found.lock().expect("supervisor callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_device_lost(&self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        *self.on_device_lost.lock().expect("supervisor callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_device_connected(&self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        *self.on_device_connected.lock().expect("supervisor callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_device_disconnected(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_device_disconnected.lock().expect("supervisor callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_health_changed(&self, f: impl Fn(&str, f32) + Send + Sync + 'static) {
        *self.on_health_changed.lock().expect("supervisor callback mutex poisoned") = Some(Box::new(f));
    }

    fn wire_callbacks(self: &Arc<Self>) {
        // Discovery.on_device_found -> front-end display callback.
        let this = self.clone();
        self.discovery.set_on_device_found(move |device| {
            if let Some(cb) = this.on_device_found.lock().expect("supervisor callback mutex poisoned").as_ref() {
                cb(device);
            }
        });

        // Discovery.on_device_lost -> front-end display callback.
        let this = self.clone();
        self.discovery.set_on_device_lost(move |device| {
            if let Some(cb) = this.on_device_lost.lock().expect("supervisor callback mutex poisoned").as_ref() {
                cb(device);
            }
        });

        // Discovery.on_app_device_found -> Manager.connect (if Pool has a
        // slot), and also front-end display callback.
        let this = self.clone();
        self.discovery.set_on_app_device_found(move |device| {
            if let Some(cb) = this.on_app_device_found.lock().expect("supervisor callback mutex poisoned").as_ref() {
                cb(device);
            }
            if this.pool.connection_count() >= this.config.max_concurrent_connections {
                return;
            }
            let this = this.clone();
            let address = device.address.clone();
            let device = device.clone();
            tokio::spawn(async move {
                match this.manager.connect_with_retry(&address, Some(device)).await {
                    Ok(true) => info!("connected to app device {address}"),
                    Ok(false) => warn!("connect to {address} refused (pool full)"),
                    Err(e) => warn!("failed to connect to app device {address}: {e}"),
                }
            });
        });

        // Manager.on_device_connected -> Pool.add, and front-end display callback.
        let this = self.clone();
        self.manager.set_on_device_connected(move |device| {
            match this.pool.add(&device.address, device.clone(), Priority::Normal, Instant::now()) {
                Ok(()) => this.discovery.set_connected_count(this.pool.connection_count()),
                Err(e) => warn!("pool refused {}: {e:?}", device.address),
            }
            if let Some(cb) = this.on_device_connected.lock().expect("supervisor callback mutex poisoned").as_ref() {
                cb(device);
            }
        });

        // Manager.on_device_disconnected -> Pool.remove, and front-end display callback.
        let this = self.clone();
        self.manager.set_on_device_disconnected(move |address| {
            this.pool.remove(address, false, Instant::now());
            this.discovery.set_connected_count(this.pool.connection_count());
            if let Some(cb) = this.on_device_disconnected.lock().expect("supervisor callback mutex poisoned").as_ref() {
                cb(address);
            }
        });

        // Pool.on_health_changed -> front-end display callback.
        let this = self.clone();
        self.pool.set_on_health_changed(move |address, score| {
            if let Some(cb) = this.on_health_changed.lock().expect("supervisor callback mutex poisoned").as_ref() {
                cb(address, score);
            }
        });

        // Manager.on_bluetooth_message(address, bytes) -> Handler.receive ->
        // forward targets -> Manager.send. Central-path forwards do not
        // additionally fan out through the GATT server.
        let this = self.clone();
        self.manager.set_on_message_received(move |address, bytes| {
            this.clone().handle_inbound(address.to_string(), bytes, false);
        });

        // GattServer.on_message_received(client, bytes) -> Handler.receive ->
        // forward targets -> Manager.send and GattServer.notify.
        let this = self.clone();
        self.gatt_server.set_on_message_received(move |client, bytes| {
            this.clone().handle_inbound(client.to_string(), bytes, true);
        });

        // Handler.on_message_received -> front-end display callback.
        let this = self.clone();
        self.handler.set_on_received(move |msg| {
            if let Some(cb) = this.on_message_received.lock().expect("supervisor callback mutex poisoned").as_ref() {
                cb(msg);
            }
        });
    }

    fn handle_inbound(self: Arc<Self>, source: String, bytes: Vec<u8>, also_notify_gatt: bool) {
        tokio::spawn(async move {
            let connected = self.manager.connected_addresses();
            let outcome = self.handler.receive(&bytes, &source, &connected);

            let Some(message) = outcome.delivered else { return };
            self.pool.with_entry_mut(&source, |e| e.record_received(bytes.len(), Instant::now()));
            if outcome.forward_to.is_empty() {
                return;
            }
            let Some(forward_bytes) = self.handler.prepare_forward(&message) else { return };

            for target in &outcome.forward_to {
                match self.manager.send(target, forward_bytes.clone()).await {
                    Ok(()) => {
                        self.pool.with_entry_mut(target, |e| e.record_sent(forward_bytes.len(), Instant::now()));
                    }
                    Err(e) => warn!("forward to {target} failed: {e}"),
                }
            }
            if also_notify_gatt {
                if let Err(e) = self.gatt_server.notify(&forward_bytes).await {
                    warn!("gatt notify during forward failed: {e}");
                }
            }
        });
    }

    /// `create(content, sender_name?) -> Message` followed by the fan-out
    /// the front-end's "send" command drives: originate through the router,
    /// write to every connected central-role peer, and broadcast via the
    /// GATT server's notification characteristic.
    pub async fn send_local(&self, content: &str, sender_name: Option<&str>) -> Result<Message, BeaconError> {
        let local_id = self.local_id().to_string();
        let message = self.handler.create(content, &local_id, sender_name, None)?;

        let connected = self.manager.connected_addresses();
        let (message, targets) = self.handler.send(message, &connected);
        let encoded = message.encode();

        for target in &targets {
            match self.manager.send(target, encoded.clone()).await {
                Ok(()) => {
                    self.pool.with_entry_mut(target, |e| e.record_sent(encoded.len(), Instant::now()));
                }
                Err(e) => warn!("send to {target} failed: {e}"),
            }
        }
        if self.gatt_server.state() == ServerState::Running {
            if let Err(e) = self.gatt_server.notify(&encoded).await {
                warn!("gatt notify of local message failed: {e}");
            }
        }
        Ok(message)
    }

    pub fn local_id(&self) -> &str {
        self.manager.local_address()
    }

    /// Starts components 6 -> 9 in order: GATT server, central
    /// Manager (heartbeat + cleanup loops), Discovery, then the pool
    /// maintenance loop this Supervisor owns directly.
    pub async fn start(self: &Arc<Self>) -> Result<(), BeaconError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.gatt_server.start().await {
            warn!("GATT server failed to start: {e}; continuing as central-only");
        }

        let (heartbeat, cleanup) = self.manager.start();
        let discovery_task = self.discovery.start();
        let maintenance_task = self.spawn_pool_maintenance();

        let mut tasks = self.tasks.lock().expect("supervisor tasks mutex poisoned");
        tasks.push(heartbeat);
        tasks.push(cleanup);
        tasks.push(discovery_task);
        tasks.push(maintenance_task);

        info!("supervisor started: local id {}", self.local_id());
        Ok(())
    }

    fn spawn_pool_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.pool.run_maintenance(Instant::now());
            }
        })
    }

    /// Reverse-order, idempotent shutdown.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.discovery.stop();
        self.manager.stop();
        if let Err(e) = self.gatt_server.stop().await {
            error!("GATT server failed to stop cleanly: {e}");
        }

        let handles: Vec<_> = self.tasks.lock().expect("supervisor tasks mutex poisoned").drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        info!("supervisor stopped");
    }

    /// Blocks until a shutdown signal (SIGINT/SIGTERM via Ctrl-C) arrives,
    /// then runs `stop`.
    pub async fn run_until_shutdown(self: &Arc<Self>) {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to install ctrl-c handler; shutting down immediately");
        } else {
            info!("shutdown signal received");
        }
        self.stop().await;
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn handler(&self) -> &Arc<MessageHandler> {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{MockCentral, MockPeripheral};

    fn supervisor() -> Arc<Supervisor> {
        Supervisor::new(Arc::new(Config::default()), Arc::new(MockCentral::new()), Arc::new(MockPeripheral::new()))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let sup = supervisor();
        sup.start().await.unwrap();
        sup.start().await.unwrap();
        sup.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_without_start() {
        let sup = supervisor();
        sup.stop().await;
    }

    #[tokio::test]
    async fn send_local_creates_and_returns_message() {
        let sup = supervisor();
        let msg = sup.send_local("hello mesh", Some("tester")).await.unwrap();
        assert_eq!(msg.content, "hello mesh");
    }

    #[tokio::test]
    async fn manager_connect_feeds_pool_add() {
        let sup = supervisor();
        assert_eq!(sup.pool.connection_count(), 0);

        sup.manager.connect_with_retry("AA:BB", None).await.unwrap();
        // Manager.on_device_connected -> Pool.add is wired in Supervisor::new.
        assert_eq!(sup.pool.connection_count(), 1);
        assert!(sup.pool.is_connected("AA:BB"));
    }

    #[tokio::test]
    async fn manager_disconnect_feeds_pool_remove() {
        let sup = supervisor();
        sup.manager.connect_with_retry("AA:BB", None).await.unwrap();
        assert!(sup.pool.is_connected("AA:BB"));

        sup.manager.disconnect("AA:BB").await.unwrap();
        assert!(!sup.pool.is_connected("AA:BB"));
    }

    #[tokio::test]
    async fn front_end_connect_disconnect_callbacks_fire_alongside_internal_wiring() {
        let sup = supervisor();
        let connected = Arc::new(Mutex::new(None));
        let disconnected = Arc::new(Mutex::new(None));
        let connected_clone = connected.clone();
        let disconnected_clone = disconnected.clone();

        sup.set_on_device_connected(move |device| {
            *connected_clone.lock().unwrap() = Some(device.address.clone());
        });
        sup.set_on_device_disconnected(move |address| {
            *disconnected_clone.lock().unwrap() = Some(address.to_string());
        });

        sup.manager.connect_with_retry("AA:BB", None).await.unwrap();
        assert_eq!(connected.lock().unwrap().as_deref(), Some("AA:BB"));
        assert!(sup.pool.is_connected("AA:BB"), "internal Pool.add wiring must still run");

        sup.manager.disconnect("AA:BB").await.unwrap();
        assert_eq!(disconnected.lock().unwrap().as_deref(), Some("AA:BB"));
        assert!(!sup.pool.is_connected("AA:BB"), "internal Pool.remove wiring must still run");
    }

    #[tokio::test]
    async fn send_local_records_traffic_against_connected_targets() {
        let sup = supervisor();
        sup.manager.connect_with_retry("AA:BB", None).await.unwrap();

        sup.send_local("hello mesh", None).await.unwrap();

        let snapshot = sup.pool.snapshot(Instant::now());
        let entry = snapshot.iter().find(|s| s.address == "AA:BB").unwrap();
        assert_eq!(entry.messages_sent, 1);
    }

    #[tokio::test]
    async fn inbound_message_records_received_traffic_against_source() {
        let sup = supervisor();
        sup.manager.connect_with_retry("peer-a", None).await.unwrap();

        let sender = supervisor();
        let msg = sender.send_local("hi mesh", None).await.unwrap();
        let bytes = msg.encode();

        sup.clone().handle_inbound("peer-a".to_string(), bytes, false);
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let snapshot = sup.pool.snapshot(Instant::now());
        let entry = snapshot.iter().find(|s| s.address == "peer-a").unwrap();
        assert_eq!(entry.messages_received, 1);
    }

    #[tokio::test]
    async fn inbound_message_surfaces_to_front_end_callback() {
        let sender = supervisor();
        let msg = sender.send_local("hi mesh", None).await.unwrap();
        let bytes = msg.encode();

        let receiver = supervisor();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        receiver.set_on_message_received(move |m| {
            *seen_clone.lock().unwrap() = Some(m.content.clone());
        });

        receiver.clone().handle_inbound("peer-a".to_string(), bytes, false);
        // handle_inbound spawns a task; yield so it runs before asserting.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(seen.lock().unwrap().as_deref(), Some("hi mesh"));
    }
}
