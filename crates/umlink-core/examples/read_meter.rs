//! Meter Read Tool
//!
//! Connects to a UM24C/UM25C/UM34C meter (or the built-in simulator) and
//! prints a reading at a fixed interval.
//!
//! Usage:
//!   cargo run --example read_meter -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port (default: first Bluetooth port found)
//!   --baud RATE       Baud rate (default: 9600)
//!   --timeout MS      Response timeout in ms (default: 800)
//!   --interval MS     Delay between readings in ms (default: 1000)
//!   --count N         Number of readings, 0 for no limit (default: 5)
//!   --group N         Select group N before reading
//!   --demo            Use the simulated meter instead of a port
//!   --json            Print readings as JSON
//!   --list            List serial ports and exit
//!
//! Set RUST_LOG=umlink_core=debug to see the bytes on the wire.

use anyhow::{bail, Context};
use std::time::Duration;
use umlink_core::prelude::*;
use umlink_core::protocol::{list_ports, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut port_name: Option<String> = None;
    let mut baud_rate = DEFAULT_BAUD_RATE;
    let mut timeout_ms = DEFAULT_TIMEOUT_MS;
    let mut interval_ms = 1000u64;
    let mut count = 5u64;
    let mut group: Option<u8> = None;
    let mut demo = false;
    let mut json = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    port_name = Some(args[i].clone());
                }
            }
            "--baud" | "-b" => {
                i += 1;
                if i < args.len() {
                    baud_rate = args[i].parse().unwrap_or(DEFAULT_BAUD_RATE);
                }
            }
            "--timeout" | "-t" => {
                i += 1;
                if i < args.len() {
                    timeout_ms = args[i].parse().unwrap_or(DEFAULT_TIMEOUT_MS);
                }
            }
            "--interval" | "-i" => {
                i += 1;
                if i < args.len() {
                    interval_ms = args[i].parse().unwrap_or(1000);
                }
            }
            "--count" | "-n" => {
                i += 1;
                if i < args.len() {
                    count = args[i].parse().unwrap_or(5);
                }
            }
            "--group" | "-g" => {
                i += 1;
                if i < args.len() {
                    group = args[i].parse().ok();
                }
            }
            "--demo" => demo = true,
            "--json" => json = true,
            "--list" | "-l" => {
                for port in list_ports() {
                    let kind = if port.is_bluetooth() { "bluetooth" } else { "serial" };
                    println!(
                        "{:<20} {:<10} {}",
                        port.name,
                        kind,
                        port.product.as_deref().unwrap_or("")
                    );
                }
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if !other.starts_with('-') => port_name = Some(other.to_string()),
            other => {
                print_help();
                bail!("Unknown option: {}", other);
            }
        }
        i += 1;
    }

    let config = ConnectionConfig {
        port_name: port_name.clone().unwrap_or_default(),
        baud_rate,
        read_timeout_ms: timeout_ms,
        ..Default::default()
    };

    let conn = if demo {
        println!("Using simulated UM25C");
        let transport = spawn_simulated_meter(MeterSimulator::new(DeviceModel::Um25c), 20);
        Connection::new(Box::new(transport), config).context("Failed to start simulator")?
    } else {
        let Some(name) = port_name.or_else(|| {
            list_ports()
                .into_iter()
                .find(|p| p.is_bluetooth())
                .map(|p| p.name)
        }) else {
            bail!("No meter port found; pass one with --port or use --demo");
        };
        println!("Connecting to {} at {} baud", name, baud_rate);
        Connection::open(ConnectionConfig {
            port_name: name.clone(),
            ..config
        })
        .with_context(|| format!("Failed to connect to {}", name))?
    };

    let mut events = conn.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ConnectionEvent::Errored(fault) = event {
                eprintln!("Connection failed: {}", fault);
            }
        }
    });

    if let Some(group) = group {
        if let Err(e) = conn.select_group(group).await {
            eprintln!("Failed to select group {}: {}", group, e);
        }
    }

    let mut taken = 0u64;
    while count == 0 || taken < count {
        match conn.read_data().await {
            Ok(reading) if json => match serde_json::to_string(&reading) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to encode reading: {}", e),
            },
            Ok(reading) => print_reading(&reading),
            Err(ProtocolError::ReadTimedOut) => eprintln!("No response within {} ms", timeout_ms),
            Err(e) => {
                eprintln!("Read failed: {}", e);
                break;
            }
        }
        taken += 1;
        if count == 0 || taken < count {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }

    let (tx, rx) = conn.counters();
    conn.close().await.context("Close failed")?;
    println!("Done: {} bytes sent, {} bytes received", tx, rx);
    Ok(())
}

fn print_reading(reading: &TimestampedDataPoint) {
    let p = &reading.point;
    let group = p.groups.get(p.screen.group as usize);
    println!(
        "{} {:?} {:>7.3} V {:>7.4} A {:>7.3} W {:>5.1} °C  group {} {:>9.1} mAh {:>9.1} mWh",
        reading.timestamp.format("%H:%M:%S%.3f"),
        p.device_model,
        p.voltage,
        p.current,
        p.power,
        p.temperature.celsius,
        p.screen.group,
        group.map(|g| g.charge / 3.6).unwrap_or(0.0),
        group.map(|g| g.energy / 3.6).unwrap_or(0.0),
    );
}

fn print_help() {
    println!("Usage: read_meter [OPTIONS] [PORT]");
    println!();
    println!("  --port PORT     Serial port (default: first Bluetooth port found)");
    println!("  --baud RATE     Baud rate (default: {})", DEFAULT_BAUD_RATE);
    println!("  --timeout MS    Response timeout in ms (default: {})", DEFAULT_TIMEOUT_MS);
    println!("  --interval MS   Delay between readings in ms (default: 1000)");
    println!("  --count N       Number of readings, 0 for no limit (default: 5)");
    println!("  --group N       Select group N before reading");
    println!("  --demo          Use the simulated meter");
    println!("  --json          Print readings as JSON");
    println!("  --list          List serial ports and exit");
}
