//! This crate shares one Sinilink XY series power supply, reachable over a serial Modbus RTU
//! line, between any number of Modbus TCP clients on the network.
//!
//! The serial line is half duplex and the PSU answers one request at a time, so the crate is
//! built around exclusive access to it:
//! * [`lease::Channel`] is the only way onto the wire; a [`lease::ChannelLease`] must be held to
//!   send a frame.
//! * [`bridge::Bridge`] forwards network requests one at a time and routes each answer back to the
//!   peer and transaction it belongs to.
//! * [`serial::SerialTransport`] drives the port on its own thread and reports every frame to the
//!   bridge.
//! * [`status::StatusPoller`] reads the live register block for dashboards when the channel is
//!   free.
//! * [`uplink::Supervisor`] watches the network uplink; requests are refused while it is down.
//!
//! The serial port used for PSU comms should be configured like so:
//! * Default baud rate: 115200
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod frame;
pub mod lease;
pub mod link;
pub mod modbus_tcp;
pub mod registers;
pub mod scaling;
pub mod serial;
pub mod status;
pub mod uplink;

#[cfg(test)]
mod mock_serial;
