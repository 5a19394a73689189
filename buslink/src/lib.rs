//! Master-side transport for a half-duplex RS-485 control bus.
//!
//! The crate is three layers. [`link`] owns the serial port, the
//! direction-control lines, and the connect/reconnect lifecycle, speaking
//! newline-delimited JSON. [`transaction`] runs single-in-flight
//! request/reply transactions over it with id correlation and timeouts.
//! [`monitor`] tracks remote-device liveness from hello and heartbeat
//! messages.

pub mod config;
pub mod error;
pub mod link;
pub mod monitor;
pub mod tracing;
pub mod transaction;

pub use config::Config;
pub use error::{Error, Result};
pub use link::{Link, LinkEvent, LinkState, LinkStatus};
pub use monitor::{ConnectionMonitor, RemoteStatus};
pub use transaction::TransactionManager;
