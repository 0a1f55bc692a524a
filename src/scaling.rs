//! Conversion of raw register values into engineering units.
//!
//! XY models differ in how many units one register count is worth. The factors come from the
//! configuration since the bridge never asks the PSU what model it is.

use serde::Deserialize;

/// Scaling factors for converting raw register values to standard units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScalingFactors {
    /// Multiplier for voltage values (e.g., 10 means raw value is in centivolts, multiply by 10 to get mV)
    pub voltage_divisor: u32,
    /// Multiplier for current values (e.g., 10 means raw value is in units of 10mA, multiply by 10 to get mA)
    pub current_divisor: u32,
    /// Multiplier for power values (e.g., 100 means raw value is in deciwatts, multiply by 100 to get mW)
    pub power_divisor: u32,
    /// Multiplier for capacity values (raw to mAh)
    pub capacity_divisor: u32,
    /// Multiplier for energy values (raw to mWh)
    pub energy_divisor: u32,
}

impl Default for ScalingFactors {
    /// The XY7025 family, the most common unit behind these bridges.
    fn default() -> Self {
        Self::new(10, 10, 1000, 10, 100)
    }
}

impl ScalingFactors {
    pub const fn new(
        voltage_divisor: u32,
        current_divisor: u32,
        power_divisor: u32,
        capacity_divisor: u32,
        energy_divisor: u32,
    ) -> Self {
        Self {
            voltage_divisor,
            current_divisor,
            power_divisor,
            capacity_divisor,
            energy_divisor,
        }
    }

    /// Convert raw voltage register value to millivolts
    #[inline]
    pub const fn raw_to_voltage_mv(&self, raw: u16) -> u32 {
        (raw as u32) * self.voltage_divisor
    }

    /// Convert raw current register value to milliamps
    #[inline]
    pub const fn raw_to_current_ma(&self, raw: u16) -> u32 {
        (raw as u32) * self.current_divisor
    }

    /// Convert raw power register value to milliwatts
    #[inline]
    pub const fn raw_to_power_mw(&self, raw: u16) -> u32 {
        (raw as u32) * self.power_divisor
    }

    /// Convert a 32 bit capacity counter to milliamp-hours
    #[inline]
    pub const fn raw_to_capacity_mah(&self, raw: u32) -> u64 {
        (raw as u64) * (self.capacity_divisor as u64)
    }

    /// Convert a 32 bit energy counter to milliwatt-hours
    #[inline]
    pub const fn raw_to_energy_mwh(&self, raw: u32) -> u64 {
        (raw as u64) * (self.energy_divisor as u64)
    }
}
