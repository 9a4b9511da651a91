//! Serial Protocol Communication
//!
//! Implements the UM24C/UM25C/UM34C meter protocol: single-byte commands
//! written to the device and a fixed 130-byte status frame read back.
//!
//! The wire pieces are split the same way the engine uses them:
//! - [`commands`]: pure command encoders
//! - [`frame`]: pure status frame decoder
//! - [`buffer`] and [`acceptor`]: receive-side reassembly
//! - [`Connection`]: the read loop and public operations

pub mod acceptor;
pub mod buffer;
pub mod commands;
mod connection;
mod error;
pub mod frame;
pub mod serial;
mod transport;

pub use acceptor::{Acceptance, Acceptor, AcceptorQueue, FixedLengthAcceptor};
pub use buffer::ReceiveBuffer;
pub use commands::{Button, Command};
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, TimestampedDataPoint,
};
pub use error::{Fault, ProtocolError};
pub use frame::{decode_frame, ChargeMode, DataPoint, DeviceModel, RawDataPoint};
pub use serial::{list_ports, open_port, PortInfo};
pub use transport::{BoxedReader, BoxedWriter, StreamTransport, Transport};

/// Default baud rate for meter communication
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default deadline for a single response in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 800;

/// Size of a device status frame in bytes
pub const FRAME_LENGTH: usize = 130;

/// Hard cap on unconsumed bytes held by the receive buffer
pub const MAX_BUF_LENGTH: usize = 1 << 20;

/// Bluetooth Serial Port Profile service class the meters advertise
pub const SERIAL_SERVICE_CLASS_ID: &str = "00001101-0000-1000-8000-00805f9b34fb";
