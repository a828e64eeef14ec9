//! Device Discovery: adaptive-interval scanner state machine.
//!
//! A single `tokio::task` runs the scan loop, guarding all shared state
//! behind one `std::sync::Mutex` so a scan result, a network-state
//! recompute, and a lost-device sweep never interleave.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::ble::driver::{Advertisement, BleCentral};
use crate::config::Config;
use crate::device::{ConnectionState, DeviceInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    NoDevices,
    Discovering,
    Moderate,
    Stable,
}

/// Discovery statistics surfaced to the front-end for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryStats {
    pub scan_count: u64,
    pub successful_scans: u64,
    pub devices_found: u64,
    pub consecutive_empty_scans: u32,
    pub last_scan_duration_ms: u64,
}

struct Inner {
    discovered: HashMap<String, DeviceInfo>,
    app_devices: HashSet<String>,
    per_scan_seen: HashSet<String>,
    stats: DiscoveryStats,
    connected_count: usize,
}

pub struct Discovery {
    config: Arc<Config>,
    central: Arc<dyn BleCentral>,
    state: Mutex<ScanState>,
    network_state: Mutex<NetworkState>,
    current_interval: Mutex<Duration>,
    inner: Mutex<Inner>,
    running: Arc<AtomicBool>,
    scan_lock: AsyncMutex<()>,
    on_device_found: Mutex<Option<Box<dyn Fn(&DeviceInfo) + Send + Sync>>>,
    on_app_device_found: Mutex<Option<Box<dyn Fn(&DeviceInfo) + Send + Sync>>>,
    on_device_lost: Mutex<Option<Box<dyn Fn(&DeviceInfo) + Send + Sync>>>,
}

impl Discovery {
    pub fn new(config: Arc<Config>, central: Arc<dyn BleCentral>) -> Arc<Self> {
        let initial_interval = config.discovery_interval_initial;
        Arc::new(Self {
            config,
            central,
            state: Mutex::new(ScanState::Idle),
            network_state: Mutex::new(NetworkState::NoDevices),
            current_interval: Mutex::new(initial_interval),
            inner: Mutex::new(Inner {
                discovered: HashMap::new(),
                app_devices: HashSet::new(),
                per_scan_seen: HashSet::new(),
                stats: DiscoveryStats::default(),
                connected_count: 0,
            }),
            running: Arc::new(AtomicBool::new(false)),
            scan_lock: AsyncMutex::new(()),
            on_device_found: Mutex::new(None),
            on_app_device_found: Mutex::new(None),
            on_device_lost: Mutex::new(None),
        })
    }

    pub fn set_on_device_found(&self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        *self.on_device_found.lock().expect("discovery callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_app_device_found(&self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        *self.on_app_device_found.lock().expect("discovery callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn set_on_device_lost(&self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        *self.on_device_lost.lock().expect("discovery callback mutex poisoned") = Some(Box::new(f));
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock().expect("discovery state mutex poisoned")
    }

    pub fn network_state(&self) -> NetworkState {
        *self.network_state.lock().expect("discovery state mutex poisoned")
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.inner.lock().expect("discovery inner mutex poisoned").stats.clone()
    }

    /// Tell Discovery how many peers the Manager currently has connected, so
    /// `NetworkState` classification stays accurate.
    pub fn set_connected_count(&self, count: usize) {
        self.inner.lock().expect("discovery inner mutex poisoned").connected_count = count;
    }

    pub fn get_device(&self, address: &str) -> Option<DeviceInfo> {
        self.inner.lock().expect("discovery inner mutex poisoned").discovered.get(address).cloned()
    }

    /// Spawns the scan loop as a background task. Returns a handle the
    /// Supervisor can `.abort()` on shutdown.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        *self.state.lock().expect("discovery state mutex poisoned") = ScanState::Scanning;

        let this = self.clone();
        tokio::spawn(async move {
            info!("discovery scan loop started");
            while this.running.load(Ordering::SeqCst) {
                if let Err(e) = this.scan_once().await {
                    warn!("discovery scan failed: {e}");
                    let mut interval = this.current_interval.lock().expect("discovery interval mutex poisoned");
                    *interval = (*interval * 3 / 2).min(this.config.max_scan_interval);
                }
                this.check_lost_devices();

                let wait = *this.current_interval.lock().expect("discovery interval mutex poisoned");
                tokio::time::sleep(wait).await;
            }
            info!("discovery scan loop stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.state.lock().expect("discovery state mutex poisoned") = ScanState::Stopped;
    }

    /// One scan window (per-scan algorithm), bounded by
    /// `DEFAULT_SCAN_TIMEOUT`.
    async fn scan_once(self: &Arc<Self>) -> Result<(), crate::error::BluetoothError> {
        let _guard = self.scan_lock.lock().await;

        self.inner.lock().expect("discovery inner mutex poisoned").per_scan_seen.clear();

        let this = self.clone();
        let start = Instant::now();
        let service_uuid = self.config.service_uuid.to_lowercase();

        self.central
            .start_scan(Box::new(move |adv: Advertisement| {
                this.on_advertisement(adv, &service_uuid);
            }))
            .await?;

        tokio::time::sleep(self.config.default_scan_timeout).await;
        self.central.stop_scan().await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let mut inner = self.inner.lock().expect("discovery inner mutex poisoned");
        inner.stats.scan_count += 1;
        inner.stats.last_scan_duration_ms = duration_ms;
        let found_this_scan = inner.per_scan_seen.len();
        if found_this_scan > 0 {
            inner.stats.successful_scans += 1;
            inner.stats.devices_found += found_this_scan as u64;
            inner.stats.consecutive_empty_scans = 0;
        } else {
            inner.stats.consecutive_empty_scans += 1;
        }
        drop(inner);

        self.update_network_state();
        Ok(())
    }

    fn on_advertisement(&self, adv: Advertisement, service_uuid: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("discovery inner mutex poisoned");

        if !inner.per_scan_seen.insert(adv.address.clone()) {
            return;
        }

        let is_app_device = adv.service_uuids.iter().any(|u| u.eq_ignore_ascii_case(service_uuid))
            || adv.service_data.iter().any(|u| u.eq_ignore_ascii_case(service_uuid));

        let is_new = !inner.discovered.contains_key(&adv.address);
        if is_new {
            let device = DeviceInfo::new(adv.address.clone(), adv.name.clone().unwrap_or_default(), adv.rssi, now);
            inner.discovered.insert(adv.address.clone(), device);
        } else if let Some(existing) = inner.discovered.get_mut(&adv.address) {
            existing.rssi = adv.rssi;
            existing.last_seen = now;
        }

        let newly_app = is_app_device && inner.app_devices.insert(adv.address.clone());

        let device = inner.discovered.get(&adv.address).cloned();
        drop(inner);

        if let Some(device) = device {
            if is_new {
                if let Some(cb) = self.on_device_found.lock().expect("discovery callback mutex poisoned").as_ref() {
                    cb(&device);
                }
            }
            if newly_app {
                debug!("app device found: {}", device.address);
                if let Some(cb) = self.on_app_device_found.lock().expect("discovery callback mutex poisoned").as_ref() {
                    cb(&device);
                }
            }
        }
    }

    fn check_lost_devices(&self) {
        let now = Instant::now();
        let threshold = self.config.device_lost_threshold;

        let mut inner = self.inner.lock().expect("discovery inner mutex poisoned");
        let lost: Vec<String> = inner
            .discovered
            .iter()
            .filter(|(_, d)| now.saturating_duration_since(d.last_seen) > threshold)
            .map(|(addr, _)| addr.clone())
            .collect();

        let mut lost_devices = Vec::with_capacity(lost.len());
        for addr in &lost {
            if let Some(device) = inner.discovered.remove(addr) {
                inner.app_devices.remove(addr);
                lost_devices.push(device);
            }
        }
        drop(inner);

        if let Some(cb) = self.on_device_lost.lock().expect("discovery callback mutex poisoned").as_ref() {
            for device in &lost_devices {
                cb(device);
            }
        }
    }

    /// Classify `NetworkState`, compute a target interval, apply
    /// consecutive-empty-scan penalties, then smooth toward it.
    fn update_network_state(&self) {
        let (app_count, connected_count) = {
            let inner = self.inner.lock().expect("discovery inner mutex poisoned");
            (inner.app_devices.len(), inner.connected_count)
        };

        let network_state = if app_count == 0 {
            NetworkState::NoDevices
        } else if connected_count == 0 {
            NetworkState::Discovering
        } else if connected_count < self.config.max_concurrent_connections {
            NetworkState::Moderate
        } else {
            NetworkState::Stable
        };
        *self.network_state.lock().expect("discovery state mutex poisoned") = network_state;

        let mut target = match network_state {
            NetworkState::NoDevices => self.config.discovery_interval_no_devices,
            NetworkState::Discovering => self.config.discovery_interval_initial,
            NetworkState::Moderate => self.config.discovery_interval_moderate,
            NetworkState::Stable => self.config.discovery_interval_stable,
        };

        let consecutive_empty = self.inner.lock().expect("discovery inner mutex poisoned").stats.consecutive_empty_scans;
        if consecutive_empty > 10 {
            target = target.mul_f64(2.0);
        } else if consecutive_empty > 5 {
            target = target.mul_f64(1.5);
        }
        target = target.min(self.config.max_scan_interval);

        let mut current = self.current_interval.lock().expect("discovery interval mutex poisoned");
        let smoothed = (*current + target) / 2;
        *current = smoothed.clamp(self.config.min_scan_interval, self.config.max_scan_interval);
    }
}
