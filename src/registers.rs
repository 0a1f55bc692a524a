//! The PSU's live register block and the types decoded from it.
//!
//! The status poller reads registers `0x00..=0x12` in one request; everything a dashboard needs
//! lives in that block.

use strum_macros::{Display, EnumIter};

/// Number of registers in the live block.
pub const LIVE_BLOCK_LEN: u16 = 19;

#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumIter)]
#[repr(u16)]
pub enum LiveRegister {
    /// __R/W__ - Voltage setting.
    VSet = 0x00,
    /// __R/W__ - Current setting.
    ISet = 0x01,
    /// __R__ - Output voltage display value.
    VOut = 0x02,
    /// __R__ - Output current display value.
    IOut = 0x03,
    /// __R__ - Output power display value.
    Power = 0x04,
    /// __R__ - Input voltage display value.
    UIn = 0x05,
    /// __R__ - Output Ah, low 16 bits.
    AhLow = 0x06,
    /// __R__ - Output Ah, high 16 bits.
    AhHigh = 0x07,
    /// __R__ - Output Wh, low 16 bits.
    WhLow = 0x08,
    /// __R__ - Output Wh, high 16 bits.
    WhHigh = 0x09,
    /// __R__ - Output on time, hours.
    OutH = 0x0A,
    /// __R__ - Output on time, minutes.
    OutM = 0x0B,
    /// __R__ - Output on time, seconds.
    OutS = 0x0C,
    /// __R__ - Internal temperature.
    TIn = 0x0D,
    /// __R__ - External probe temperature.
    TEx = 0x0E,
    /// __R/W__ - Key lock.
    Lock = 0x0F,
    /// __R/W__ - Protect status, see [`ProtectionStatus`].
    Protect = 0x10,
    /// __R__ - Constant voltage / constant current, see [`ControlMode`].
    CvCc = 0x11,
    /// __R/W__ - Output switch.
    OnOff = 0x12,
}

impl LiveRegister {
    /// Position of this register in a block read starting at `start`.
    pub fn index_from(self, start: u16) -> Option<usize> {
        (self as u16).checked_sub(start).map(usize::from)
    }
}

impl From<LiveRegister> for u16 {
    fn from(value: LiveRegister) -> Self {
        value as u16
    }
}

/// Regulation mode the PSU is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum ControlMode {
    /// Constant voltage regulation mode.
    Cv,
    /// Constant current regulation mode.
    Cc,
}

impl From<u16> for ControlMode {
    fn from(value: u16) -> Self {
        match value {
            0 => ControlMode::Cv,
            _ => ControlMode::Cc,
        }
    }
}

/// Used to be less ambiguous about whether something is on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum State {
    Off,
    On,
}

impl From<u16> for State {
    fn from(value: u16) -> Self {
        (value != 0).into()
    }
}

impl From<bool> for State {
    fn from(value: bool) -> Self {
        match value {
            true => State::On,
            false => State::Off,
        }
    }
}

impl From<State> for bool {
    fn from(value: State) -> Self {
        value == State::On
    }
}

/// "Protection status register".
#[derive(Debug, EnumIter, PartialEq, Eq, Clone, Copy, Display)]
#[repr(u16)]
pub enum ProtectionStatus {
    /// 0: No protection tripped.
    AlarmCode = 0x00,
    /// 1: OVP overvoltage protection.
    OverVoltage = 0x01,
    /// 2: OCP overcurrent protection.
    OverCurrent = 0x02,
    /// 3: OPP over-power protection.
    OverPower = 0x03,
    /// 4: LVP input undervoltage protection.
    InputUndervoltage = 0x04,
    /// 5: OAH maximum output capacity.
    MaximumOutputCapacity = 0x05,
    /// 6: OHP maximum output time.
    MaximumOutputTime = 0x06,
    /// 7: OTP over-temperature protection.
    OverTemperature = 0x07,
    /// 8: OEP no output protection.
    NoOutput = 0x08,
    /// 9: OWH maximum energy output.
    MaximumEnergyOutput = 0x09,
    /// 10: ICP maximum input current protection.
    MaximumInputCurrent = 0x0A,
    /// 11: ETP external temperature protection.
    ExternalTemperature = 0x0B,
}

impl From<u16> for ProtectionStatus {
    fn from(value: u16) -> Self {
        use ProtectionStatus as PS;
        match value {
            0x01 => PS::OverVoltage,
            0x02 => PS::OverCurrent,
            0x03 => PS::OverPower,
            0x04 => PS::InputUndervoltage,
            0x05 => PS::MaximumOutputCapacity,
            0x06 => PS::MaximumOutputTime,
            0x07 => PS::OverTemperature,
            0x08 => PS::NoOutput,
            0x09 => PS::MaximumEnergyOutput,
            0x0A => PS::MaximumInputCurrent,
            0x0B => PS::ExternalTemperature,
            // Unknown codes read as no alarm.
            _ => PS::AlarmCode,
        }
    }
}
