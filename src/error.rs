//! Our error types for the bridge, the serial channel and the uplink.

use thiserror::Error;

use crate::frame::ExceptionCode;

pub type Result<T> = core::result::Result<T, Error>;

/// Custom error type for everything that can go wrong between a network peer and the PSU.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial channel is busy")]
    Busy,
    #[error("Device failed to respond")]
    Timeout,
    #[error("Network uplink is not connected")]
    LinkDown,
    #[error("Credential storage error: {0}")]
    Persistence(#[source] std::io::Error),
    #[error("A bridge is already attached to this serial channel")]
    DuplicateArbiter,
    #[error("Serial communication error: {0:?}")]
    SerialError(embedded_io::ErrorKind),
    #[error("Modbus protocol error: {0:?}")]
    ModbusError(rmodbus::ErrorKind),
    #[error("Invalid frame")]
    InvalidFrame,
    #[error("Invalid response received")]
    InvalidResponse,
    #[error("Serial transport has shut down")]
    ChannelClosed,
    #[error("Failed to open serial port {path}: {source}")]
    PortOpen {
        path: String,
        source: serialport::Error,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rmodbus::ErrorKind> for Error {
    fn from(err: rmodbus::ErrorKind) -> Self {
        Error::ModbusError(err)
    }
}

impl Error {
    /// The Modbus exception a TCP peer receives when its request ends in this error.
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            Error::Busy | Error::Timeout | Error::LinkDown | Error::InvalidResponse => {
                ExceptionCode::GatewayTargetFailedToRespond
            }
            Error::ChannelClosed => ExceptionCode::GatewayPathUnavailable,
            _ => ExceptionCode::ServerDeviceFailure,
        }
    }
}
