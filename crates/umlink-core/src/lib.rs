//! # UMLink Core Library
//!
//! Protocol engine for the UM24C/UM25C/UM34C family of USB power meters.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Command encoding for every meter setting
//! - Decoding of the 130-byte status frame into SI units
//! - An async connection that reassembles chunked responses in strict
//!   request order, with per-request timeouts and a sticky failure state
//! - A simulated meter for running without hardware
//!
//! ## Supported Meters
//!
//! - UM24C
//! - UM25C
//! - UM34C
//!
//! ## Example
//!
//! ```rust,ignore
//! use umlink_core::protocol::{Connection, ConnectionConfig};
//!
//! let config = ConnectionConfig {
//!     port_name: "/dev/rfcomm0".to_string(),
//!     ..Default::default()
//! };
//! let conn = Connection::open(config)?;
//!
//! conn.select_group(2).await?;
//! let reading = conn.read_data().await?;
//! println!("{:.3} V, {:.4} A", reading.point.voltage, reading.point.current);
//!
//! conn.close().await?;
//! ```

pub mod demo;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::demo::{spawn_simulated_meter, MeterSimulator};
    pub use crate::protocol::{
        Button, Connection, ConnectionConfig, ConnectionEvent, ConnectionState, DataPoint,
        DeviceModel, Fault, ProtocolError, TimestampedDataPoint,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
