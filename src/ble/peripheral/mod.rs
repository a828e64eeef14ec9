//! Peripheral-role (GATT server) backends, behind the `BlePeripheral` trait
//! in `crate::ble::driver`.

pub mod bluez;

pub use bluez::BluezPeripheral;
