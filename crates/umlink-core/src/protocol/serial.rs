//! Serial port handling
//!
//! The meters expose a Bluetooth SPP serial port (service class
//! [`SERIAL_SERVICE_CLASS_ID`](super::SERIAL_SERVICE_CLASS_ID)); UM24C units
//! with the USB data cable show up as a plain USB serial adapter.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use super::{ProtocolError, StreamTransport, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/rfcomm0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Reported by the OS as a Bluetooth serial port
    pub bluetooth: bool,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        let bluetooth = basename(&name).starts_with("rfcomm");
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            bluetooth,
        }
    }

    /// Whether this port is a Bluetooth serial link, which is how the meters
    /// are normally reached
    pub fn is_bluetooth(&self) -> bool {
        self.bluetooth || basename(&self.name).starts_with("rfcomm")
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
                bluetooth: false,
            },
            SerialPortType::BluetoothPort => Self {
                bluetooth: true,
                ..Self::bare(info.port_name)
            },
            _ => Self::bare(info.port_name),
        }
    }
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Sort key so that:
///  - rfcomm* (Bluetooth SPP) ports come first, sorted numerically
///  - then ttyACM*, then ttyUSB*, each sorted numerically
///  - then other ports, sorted by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let base = basename(name);
    for (rank, prefix) in ["rfcomm", "ttyACM", "ttyUSB"].iter().enumerate() {
        if let Some(rest) = base.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank as u8, num, base.to_string());
        }
    }
    (3, 0, base.to_string())
}

/// List available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Bound rfcomm devices are not always reported by the enumeration API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("rfcomm")
                    || fname.starts_with("ttyACM")
                    || fname.starts_with("ttyUSB")
                {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port as a meter transport (8N1, no flow control)
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<StreamTransport, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    debug!("opening serial port {} at {} baud", name, baud);

    let stream = tokio_serial::new(name, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
            _ => ProtocolError::SerialError(e.to_string()),
        })?;

    Ok(StreamTransport::new(name, stream))
}
