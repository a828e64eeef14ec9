//! Entry point for the `beacond` daemon.
//!
//! Installs SIGINT/SIGTERM-equivalent shutdown handling, builds the
//! application, runs it until a shutdown signal arrives, then stops every
//! component in order.

use std::sync::Arc;

use beacon::ble::{BleCentral, BlePeripheral, BtleplugCentral, BluezPeripheral};
use beacon::config::Config;
use beacon::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    log::info!("Bluetooth Mesh Broadcast daemon starting");

    let config = Arc::new(Config::from_env());

    let central: Arc<dyn BleCentral> = Arc::new(BtleplugCentral::new(config.clone()).await?);
    let peripheral: Arc<dyn BlePeripheral> = Arc::new(BluezPeripheral::new().await?);

    let supervisor = Supervisor::new(config, central, peripheral);
    supervisor.start().await?;
    log::info!("daemon running as {}", supervisor.local_id());

    supervisor.run_until_shutdown().await;

    log::info!("daemon exited");
    Ok(())
}
