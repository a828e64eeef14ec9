//! In-memory `BleCentral`/`BlePeripheral` doubles so the Manager, GATT
//! server, and Supervisor wiring can be exercised in tests without real
//! Bluetooth hardware (ambient test-tooling requirement).

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::ble::driver::{Advertisement, BleCentral, BlePeripheral, PeerLink};
use crate::error::BluetoothError;

/// A scripted set of advertisements a test wants `start_scan` to replay.
pub struct MockCentral {
    pub scripted_advertisements: Mutex<Vec<Advertisement>>,
    pub fail_connect: StdMutex<Option<String>>,
}

impl MockCentral {
    pub fn new() -> Self {
        Self { scripted_advertisements: Mutex::new(Vec::new()), fail_connect: StdMutex::new(None) }
    }

    pub fn push_advertisement(&self, adv: Advertisement) {
        self.scripted_advertisements.lock().expect("mock central mutex poisoned").push(adv);
    }
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn start_scan(&self, on_advertisement: Box<dyn Fn(Advertisement) + Send + Sync>) -> Result<(), BluetoothError> {
        let scripted = self.scripted_advertisements.lock().expect("mock central mutex poisoned").clone();
        for adv in scripted {
            on_advertisement(adv);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BluetoothError> {
        Ok(())
    }

    async fn connect(
        &self,
        address: &str,
        _timeout: Duration,
        _service_uuid: &str,
        _characteristic_uuid: &str,
        _on_notify: Box<dyn Fn(Vec<u8>) + Send + Sync>,
        _on_disconnect: Box<dyn Fn() + Send + Sync>,
    ) -> Result<PeerLink, BluetoothError> {
        if let Some(failing) = self.fail_connect.lock().expect("mock central mutex poisoned").as_ref() {
            if failing == address {
                return Err(BluetoothError::ConnectFailure { address: address.to_string(), reason: "scripted failure".to_string() });
            }
        }
        let address = address.to_string();
        Ok(PeerLink {
            address: address.clone(),
            supports_write_without_response: true,
            write: Box::new(move |_bytes, _without_response| Box::pin(async { Ok(()) })),
        })
    }

    async fn disconnect(&self, _link: &PeerLink) -> Result<(), BluetoothError> {
        Ok(())
    }
}

/// In-memory GATT server double: records every written-to-characteristic
/// payload and every outbound notification so a test can assert on both
/// sides of the wire without D-Bus or a real adapter.
pub struct MockPeripheral {
    running: StdMutex<bool>,
    pub notified: Mutex<Vec<Vec<u8>>>,
    clients: Mutex<HashMap<String, ()>>,
}

impl MockPeripheral {
    pub fn new() -> Self {
        Self { running: StdMutex::new(false), notified: Mutex::new(Vec::new()), clients: Mutex::new(HashMap::new()) }
    }

    /// Test helper: simulate an inbound write from `client`.
    pub fn simulate_write(&self, on_write: &(dyn Fn(String, Vec<u8>) + Send + Sync), client: &str, bytes: Vec<u8>) {
        self.clients.lock().expect("mock peripheral mutex poisoned").insert(client.to_string(), ());
        on_write(client.to_string(), bytes);
    }
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    async fn start(
        &self,
        _service_uuid: &str,
        _characteristic_uuid: &str,
        _on_write: Box<dyn Fn(String, Vec<u8>) + Send + Sync>,
    ) -> Result<(), BluetoothError> {
        *self.running.lock().expect("mock peripheral mutex poisoned") = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), BluetoothError> {
        *self.running.lock().expect("mock peripheral mutex poisoned") = false;
        Ok(())
    }

    async fn notify(&self, bytes: &[u8]) -> Result<(), BluetoothError> {
        self.notified.lock().expect("mock peripheral mutex poisoned").push(bytes.to_vec());
        Ok(())
    }

    fn is_running(&self) -> bool {
        *self.running.lock().expect("mock peripheral mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_central_replays_scripted_advertisements() {
        let central = MockCentral::new();
        central.push_advertisement(Advertisement {
            address: "AA:BB".to_string(),
            name: Some("peer".to_string()),
            rssi: -40,
            service_uuids: vec![],
            service_data: vec![],
        });
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        central
            .start_scan(Box::new(move |adv| seen_clone.lock().unwrap().push(adv.address)))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["AA:BB".to_string()]);
    }

    #[tokio::test]
    async fn mock_peripheral_records_notifications() {
        let peripheral = MockPeripheral::new();
        peripheral.start("svc", "char", Box::new(|_, _| {})).await.unwrap();
        assert!(peripheral.is_running());
        peripheral.notify(b"hello").await.unwrap();
        assert_eq!(peripheral.notified.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn mock_peripheral_routes_simulated_writes() {
        let peripheral = MockPeripheral::new();
        let received = Arc::new(StdMutex::new(None));
        let received_clone = received.clone();
        let on_write: Box<dyn Fn(String, Vec<u8>) + Send + Sync> =
            Box::new(move |client, bytes| *received_clone.lock().unwrap() = Some((client, bytes)));
        peripheral.simulate_write(&on_write, "client-1", b"hi".to_vec());
        assert_eq!(received.lock().unwrap().as_ref().unwrap().0, "client-1");
    }
}
