//! Basic example: Discover nearby finders and print what they report
//!
//! Run with: cargo run --example discover_devices

use finder_ble::{DeviceChange, DeviceManager, ManagerConfig, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("finder_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting device discovery...");
    println!("Press the button on your finder to wake it up!\n");

    let manager = DeviceManager::with_btleplug(ManagerConfig::default()).await?;

    // Register callback for device changes
    let _handle = manager.on_device_updated(|update| match &update.change {
        DeviceChange::VariantResolved(kind) => {
            println!("\nDiscovered {} at {}", kind, update.address());
        }
        DeviceChange::BatteryUpdated(percent) => {
            println!("  {} battery: {:.0}%", update.address(), percent);
        }
        DeviceChange::ButtonPressed(button) => {
            println!("  {} button: {:?}", update.address(), button);
        }
        DeviceChange::BecameUnreachable => {
            println!("  {} went out of range", update.address());
        }
        _ => {}
    });

    manager.set_scanning_enabled(true)?;

    // Scan for 30 seconds, expiring stale devices as we go
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.expire_stale(chrono::Utc::now());
    }

    println!("\n=== Devices ===");
    for device in manager.devices_by_signal() {
        println!(
            "{:<20} {} rssi {:>4} battery {:>5} packets {}",
            device.display_name(),
            device.address,
            device.rssi().map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            device
                .battery_percent()
                .map(|b| format!("{:.0}%", b))
                .unwrap_or_else(|| "-".into()),
            device.packet_count,
        );
    }

    manager.shutdown()?;
    Ok(())
}
