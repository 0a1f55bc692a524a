//! Configuration file.
//!
//! Every section and every field is optional; anything left out keeps its default.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [bridge]
//! response_timeout = "1s"
//!
//! [modbus_tcp]
//! bind = "0.0.0.0:502"
//!
//! [status.scaling]
//! voltage_divisor = 10
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::bridge::BridgeConfig;
use crate::error::{Error, Result};
use crate::modbus_tcp::EndpointConfig;
use crate::serial::SerialConfig;
use crate::status::StatusConfig;
use crate::uplink::UplinkConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub bridge: BridgeConfig,
    pub modbus_tcp: EndpointConfig,
    pub status: StatusConfig,
    pub uplink: UplinkConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config(err.to_string()))
    }
}
