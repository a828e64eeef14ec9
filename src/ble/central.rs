//! `btleplug`-backed `BleCentral` (platform side).
//!
//! Drives the scan -> connect -> discover -> subscribe sequence against
//! real hardware.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central as _, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::warn;
use tokio::time::timeout;
use uuid::Uuid;

use crate::ble::driver::{Advertisement, BleCentral, PeerLink};
use crate::config::Config;
use crate::error::BluetoothError;

pub struct BtleplugCentral {
    adapter: Adapter,
    config: Arc<Config>,
}

impl BtleplugCentral {
    /// Discovers and claims the host's local Bluetooth adapter.
    pub async fn new(config: Arc<Config>) -> Result<Self, BluetoothError> {
        let manager = Manager::new().await.map_err(|_| BluetoothError::AdapterUnavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| BluetoothError::AdapterUnavailable)?
            .into_iter()
            .next()
            .ok_or(BluetoothError::AdapterUnavailable)?;
        Ok(Self { adapter, config })
    }

    async fn find_peripheral(&self, address: &str) -> Option<Peripheral> {
        let peripherals = self.adapter.peripherals().await.ok()?;
        for p in peripherals {
            if let Ok(Some(props)) = p.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Some(p);
                }
            }
        }
        None
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn start_scan(
        &self,
        on_advertisement: Box<dyn Fn(Advertisement) + Send + Sync>,
    ) -> Result<(), BluetoothError> {
        timeout(self.config.scanner_start_timeout, self.adapter.start_scan(ScanFilter::default()))
            .await
            .map_err(|_| BluetoothError::ScanFailure(format!("scan start exceeded {}s", self.config.scanner_start_timeout.as_secs())))?
            .map_err(|e| BluetoothError::ScanFailure(e.to_string()))?;

        let adapter = self.adapter.clone();
        let on_advertisement = Arc::new(on_advertisement);
        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(e) => e,
                Err(e) => {
                    warn!("failed to subscribe to adapter events: {e}");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let btleplug::api::CentralEvent::DeviceDiscovered(id)
                | btleplug::api::CentralEvent::DeviceUpdated(id) = event
                {
                    if let Ok(peripheral) = adapter.peripheral(&id).await {
                        if let Ok(Some(props)) = peripheral.properties().await {
                            let service_uuids = props
                                .services
                                .iter()
                                .map(|u| u.to_string().to_lowercase())
                                .collect();
                            let service_data = props
                                .service_data
                                .keys()
                                .map(|u| u.to_string().to_lowercase())
                                .collect();
                            on_advertisement(Advertisement {
                                address: props.address.to_string(),
                                name: props.local_name,
                                rssi: props.rssi.unwrap_or(0) as i16,
                                service_uuids,
                                service_data,
                            });
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BluetoothError> {
        timeout(self.config.scanner_stop_timeout, self.adapter.stop_scan())
            .await
            .map_err(|_| BluetoothError::ScanFailure(format!("scan stop exceeded {}s", self.config.scanner_stop_timeout.as_secs())))?
            .map_err(|e| BluetoothError::ScanFailure(e.to_string()))
    }

    async fn connect(
        &self,
        address: &str,
        connect_timeout: Duration,
        service_uuid: &str,
        characteristic_uuid: &str,
        on_notify: Box<dyn Fn(Vec<u8>) + Send + Sync>,
        on_disconnect: Box<dyn Fn() + Send + Sync>,
    ) -> Result<PeerLink, BluetoothError> {
        let peripheral = self
            .find_peripheral(address)
            .await
            .ok_or_else(|| BluetoothError::ConnectFailure { address: address.to_string(), reason: "not found in scan cache".to_string() })?;

        timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| BluetoothError::ConnectTimeout { address: address.to_string(), timeout_secs: connect_timeout.as_secs() })?
            .map_err(|e| BluetoothError::ConnectFailure { address: address.to_string(), reason: e.to_string() })?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| BluetoothError::ConnectFailure { address: address.to_string(), reason: e.to_string() })?;

        let char_uuid = Uuid::from_str(characteristic_uuid)
            .map_err(|e| BluetoothError::ConnectFailure { address: address.to_string(), reason: e.to_string() })?;

        let characteristic: Option<Characteristic> =
            peripheral.characteristics().iter().find(|c| c.uuid == char_uuid).cloned();

        let supports_write_without_response = match &characteristic {
            Some(characteristic) => {
                peripheral
                    .subscribe(characteristic)
                    .await
                    .map_err(|e| BluetoothError::ConnectFailure { address: address.to_string(), reason: e.to_string() })?;

                let notify_uuid = characteristic.uuid;
                let p = peripheral.clone();
                tokio::spawn(async move {
                    let mut stream = match p.notifications().await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("notification stream failed: {e}");
                            on_disconnect();
                            return;
                        }
                    };
                    while let Some(data) = stream.next().await {
                        if data.uuid == notify_uuid {
                            on_notify(data.value);
                        }
                    }
                    on_disconnect();
                });

                characteristic.properties.contains(btleplug::api::CharPropFlags::WRITE_WITHOUT_RESPONSE)
            }
            None => {
                // step 6: missing service is a warning, not a hard
                // failure — the peer may add the service later.
                warn!("service {service_uuid} not present on {address} yet; keeping the link without subscribing");
                true
            }
        };

        let write_peripheral = peripheral.clone();
        let write_address = address.to_string();
        Ok(PeerLink {
            address: address.to_string(),
            supports_write_without_response,
            write: Box::new(move |bytes: Vec<u8>, without_response: bool| {
                let peripheral = write_peripheral.clone();
                let address = write_address.clone();
                let write_type = if without_response { WriteType::WithoutResponse } else { WriteType::WithResponse };
                Box::pin(async move {
                    // Re-resolve the characteristic at write time: it may not
                    // have existed yet when the connection was established.
                    let characteristic = peripheral
                        .characteristics()
                        .iter()
                        .find(|c| c.uuid == char_uuid)
                        .cloned()
                        .ok_or_else(|| BluetoothError::WriteFailure {
                            address: address.clone(),
                            reason: "characteristic not present".to_string(),
                        })?;
                    peripheral
                        .write(&characteristic, &bytes, write_type)
                        .await
                        .map_err(|e| BluetoothError::WriteFailure { address, reason: e.to_string() })
                })
            }),
        })
    }

    async fn disconnect(&self, link: &PeerLink) -> Result<(), BluetoothError> {
        if let Some(peripheral) = self.find_peripheral(&link.address).await {
            peripheral
                .disconnect()
                .await
                .map_err(|e| BluetoothError::ConnectFailure { address: link.address.clone(), reason: e.to_string() })?;
        }
        Ok(())
    }
}
