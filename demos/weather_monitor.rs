//! IPVSWeather monitoring example
//!
//! Lists advertising devices while scanning, connects to the beacon as soon
//! as it shows up and prints every reading. Reconnects when the link drops.
//!
//! Run with: cargo run --example weather_monitor
//!
//! To look for a differently named beacon:
//!   cargo run --example weather_monitor -- --name BenchWeather

use ipvs_weather_ble::{Error, MonitorConfig, Result, ScanEvent, WeatherMonitor};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ipvs_weather_ble=debug")
        .init();

    println!("IPVSWeather Monitor");
    println!("===================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let mut config = MonitorConfig::default();
    if let Some(name) = args
        .iter()
        .position(|arg| arg == "--name")
        .and_then(|i| args.get(i + 1))
    {
        config = config.target_name(name.clone());
    }

    println!("Looking for {}...\n", config.target_name);

    let monitor = Arc::new(WeatherMonitor::new(config).await?);

    // Print names as they are discovered
    let mut scan_rx = monitor.subscribe_scan();
    tokio::spawn(async move {
        while let Ok(event) = scan_rx.recv().await {
            match event {
                ScanEvent::Discovered(device) => {
                    if let Some(name) = device.name {
                        println!("  seen: {}", name);
                    }
                }
                ScanEvent::TargetFound { device, .. } => {
                    println!("\nFound {}, connecting...", device);
                }
                ScanEvent::Aborted(reason) => println!("Scan aborted: {:?}", reason),
            }
        }
    });

    let _handle = monitor.store().on_reading_updated(|reading| {
        println!("Weather: {}", reading);
    });

    let runner = {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            loop {
                match monitor.run().await {
                    Ok(()) => break Ok(()),
                    Err(Error::ConnectionLost) => {
                        println!("Connection lost, scanning again...");
                    }
                    Err(e) if e.is_retryable() => {
                        println!("Connection failed ({}), retrying...", e);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    Err(e) => break Err(e),
                }
            }
        })
    };

    println!("Press Ctrl+C to exit.\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\n\nExiting...");
        }
        result = runner => {
            if let Ok(Err(e)) = result {
                println!("Monitor stopped: {}", e);
            }
        }
    }

    println!(
        "Last reading: {} °C, {} %",
        monitor.store().temperature_display(),
        monitor.store().humidity_display()
    );

    monitor.shutdown().await?;

    Ok(())
}
