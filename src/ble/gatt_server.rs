//! GATT Server: the peripheral role — advertise `SERVICE_UUID`,
//! host the single read/write/notify characteristic, and hand inbound
//! writes to the Handler via callback.
//!
//! Tracks an explicit STOPPED/STARTING/RUNNING/STOPPING state machine over
//! the `BlePeripheral` driver trait, so concurrent start/stop calls settle
//! into a single consistent state instead of racing the underlying adapter.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::ble::driver::BlePeripheral;
use crate::config::Config;
use crate::error::BluetoothError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

pub struct GattServer {
    config: Arc<Config>,
    peripheral: Arc<dyn BlePeripheral>,
    state: AtomicU8,
    on_message_received: Mutex<Option<Box<dyn Fn(&str, Vec<u8>) + Send + Sync>>>,
}

impl GattServer {
    pub fn new(config: Arc<Config>, peripheral: Arc<dyn BlePeripheral>) -> Arc<Self> {
        Arc::new(Self {
            config,
            peripheral,
            state: AtomicU8::new(ServerState::Stopped as u8),
            on_message_received: Mutex::new(None),
        })
    }

    pub fn set_on_message_received(&self, f: impl Fn(&str, Vec<u8>) + Send + Sync + 'static) {
        *self.on_message_received.lock().expect("gatt server callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// `start()`: idempotent when RUNNING; on failure the
    /// state returns to STOPPED rather than leaking an advertising handle.
    pub async fn start(self: &Arc<Self>) -> Result<(), BluetoothError> {
        if self.state() == ServerState::Running {
            return Ok(());
        }
        self.state.store(ServerState::Starting as u8, Ordering::SeqCst);

        let this = self.clone();
        let on_write: Box<dyn Fn(String, Vec<u8>) + Send + Sync> = Box::new(move |client, value| {
            this.handle_write(client, value);
        });

        match self.peripheral.start(&self.config.service_uuid, &self.config.characteristic_uuid, on_write).await {
            Ok(()) => {
                self.state.store(ServerState::Running as u8, Ordering::SeqCst);
                info!("GATT server running, advertising {}", self.config.service_uuid);
                Ok(())
            }
            Err(e) => {
                self.state.store(ServerState::Stopped as u8, Ordering::SeqCst);
                warn!("GATT server failed to start: {e}");
                Err(e)
            }
        }
    }

    /// `stop()`: idempotent when STOPPED.
    pub async fn stop(&self) -> Result<(), BluetoothError> {
        if self.state() == ServerState::Stopped {
            return Ok(());
        }
        self.state.store(ServerState::Stopping as u8, Ordering::SeqCst);
        let result = self.peripheral.stop().await;
        self.state.store(ServerState::Stopped as u8, Ordering::SeqCst);
        result
    }

    /// `notify(bytes)`: non-blocking, no per-client retry.
    pub async fn notify(&self, bytes: &[u8]) -> Result<(), BluetoothError> {
        if self.state() != ServerState::Running {
            return Ok(());
        }
        self.peripheral.notify(bytes).await
    }

    fn handle_write(&self, client: String, value: Vec<u8>) {
        if let Some(cb) = self.on_message_received.lock().expect("gatt server callback mutex poisoned").as_ref() {
            cb(&client, value);
        }
    }
}
