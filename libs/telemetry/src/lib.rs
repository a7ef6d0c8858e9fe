//! Telemetry sessions over UAVTalk.
//!
//! A [`Session`] owns one [`Transport`] and turns the bytes it delivers into
//! [`uavo::ObjectInstance`]s. On a live link it also runs the connection
//! handshake, retries object requests, waits for acknowledgements and pulls
//! files off the flight controller. Recorded logs replay through the same
//! session with a [`ReaderTransport`].

pub mod config;
pub mod error;
pub mod log_header;
pub mod pending;
pub mod session;
pub mod transport;

pub use config::{ServiceMode, SessionConfig};
pub use error::Error;
pub use log_header::LogHeader;
pub use session::{ConnectionPhase, Iter, Session};
pub use transport::{ReaderTransport, Received, TcpTransport, Transport};
