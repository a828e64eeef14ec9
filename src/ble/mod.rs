//! Bluetooth Low Energy engine: the dual-role driver contract, the
//! concrete central/peripheral backends, and the platform-agnostic
//! discovery/pool/manager/gatt-server logic built on top of it.

pub mod central;
pub mod discovery;
pub mod driver;
pub mod gatt_server;
pub mod manager;
pub mod peripheral;
pub mod pool;

#[cfg(test)]
pub mod mock;

pub use central::BtleplugCentral;
pub use discovery::Discovery;
pub use driver::{Advertisement, BleCentral, BlePeripheral, PeerLink};
pub use gatt_server::GattServer;
pub use manager::Manager;
pub use peripheral::BluezPeripheral;
pub use pool::ConnectionPool;
