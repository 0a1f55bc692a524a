//! Periodic status reads for dashboards.
//!
//! The poller is the second user of the serial channel. It takes the lease like anyone else,
//! but never waits for it: a tick that finds the channel busy is skipped. Results go out on a
//! broadcast channel, and ticks are skipped entirely while nobody listens.

use std::sync::Arc;
use std::time::Duration;

use fugit::Duration as OutputTime;
use rmodbus::{client::ModbusRequest, ModbusProto};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::frame::RtuBuffer;
use crate::lease::LeaseOwner;
use crate::registers::{ControlMode, LiveRegister, ProtectionStatus, State, LIVE_BLOCK_LEN};
use crate::scaling::ScalingFactors;
use crate::serial::Direction;

const STATUS_FEED_CAPACITY: usize = 8;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub unit_id: u8,
    pub start_register: u16,
    pub register_count: u16,
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    pub scaling: ScalingFactors,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            unit_id: 1,
            start_register: 0,
            register_count: LIVE_BLOCK_LEN,
            response_timeout: Duration::from_millis(500),
            scaling: ScalingFactors::default(),
        }
    }
}

/// One decoded read of the live register block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveStatus {
    pub voltage_set_mv: u32,
    pub current_set_ma: u32,
    pub voltage_out_mv: u32,
    pub current_out_ma: u32,
    pub power_out_mw: u32,
    pub voltage_in_mv: u32,
    pub capacity_mah: u64,
    pub energy_mwh: u64,
    /// How long the output has been on.
    pub output_time: OutputTime<u32, 1, 1>,
    /// Tenths of a degree, in the unit selected on the PSU.
    pub temperature_internal: u16,
    pub temperature_external: u16,
    pub keypad_lock: State,
    pub protection: ProtectionStatus,
    pub control_mode: ControlMode,
    pub output: State,
}

impl LiveStatus {
    /// Decode registers read starting at `start`.
    pub fn from_registers(registers: &[u16], start: u16, scaling: &ScalingFactors) -> Result<Self> {
        let get = |register: LiveRegister| {
            register
                .index_from(start)
                .and_then(|index| registers.get(index))
                .copied()
                .ok_or(Error::InvalidResponse)
        };
        let wide = |low: LiveRegister, high: LiveRegister| -> Result<u32> {
            Ok(u32::from(get(low)?) | (u32::from(get(high)?) << 16))
        };

        let output_time = OutputTime::<u32, 1, 1>::hours(u32::from(get(LiveRegister::OutH)?))
            + OutputTime::<u32, 1, 1>::minutes(u32::from(get(LiveRegister::OutM)?))
            + OutputTime::<u32, 1, 1>::secs(u32::from(get(LiveRegister::OutS)?));

        Ok(Self {
            voltage_set_mv: scaling.raw_to_voltage_mv(get(LiveRegister::VSet)?),
            current_set_ma: scaling.raw_to_current_ma(get(LiveRegister::ISet)?),
            voltage_out_mv: scaling.raw_to_voltage_mv(get(LiveRegister::VOut)?),
            current_out_ma: scaling.raw_to_current_ma(get(LiveRegister::IOut)?),
            power_out_mw: scaling.raw_to_power_mw(get(LiveRegister::Power)?),
            voltage_in_mv: scaling.raw_to_voltage_mv(get(LiveRegister::UIn)?),
            capacity_mah: scaling
                .raw_to_capacity_mah(wide(LiveRegister::AhLow, LiveRegister::AhHigh)?),
            energy_mwh: scaling.raw_to_energy_mwh(wide(LiveRegister::WhLow, LiveRegister::WhHigh)?),
            output_time,
            temperature_internal: get(LiveRegister::TIn)?,
            temperature_external: get(LiveRegister::TEx)?,
            keypad_lock: get(LiveRegister::Lock)?.into(),
            protection: get(LiveRegister::Protect)?.into(),
            control_mode: get(LiveRegister::CvCc)?.into(),
            output: get(LiveRegister::OnOff)?.into(),
        })
    }
}

pub struct StatusPoller {
    bridge: Arc<Bridge>,
    updates: broadcast::Sender<LiveStatus>,
    config: StatusConfig,
}

impl StatusPoller {
    pub fn new(bridge: Arc<Bridge>, config: StatusConfig) -> Arc<Self> {
        let (updates, _) = broadcast::channel(STATUS_FEED_CAPACITY);
        Arc::new(Self {
            bridge,
            updates,
            config,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveStatus> {
        self.updates.subscribe()
    }

    /// Read the live block once. Fails with [`Error::Busy`] straight away if the channel is taken.
    pub async fn poll_once(&self) -> Result<LiveStatus> {
        let lease = self.bridge.channel().try_acquire(LeaseOwner::StatusPoller)?;
        // Subscribed before sending so the answer cannot slip past.
        let mut frames = self.bridge.subscribe_frames();

        let mut request = ModbusRequest::new(self.config.unit_id, ModbusProto::Rtu);
        let mut buff = RtuBuffer::new();
        request.generate_get_holdings(
            self.config.start_register,
            self.config.register_count,
            &mut buff,
        )?;
        let ticket = lease.send(buff)?;

        // Only the answer read for our own request counts. A late answer to an earlier request
        // can still be on its way when the lease is granted.
        let response = tokio::time::timeout(self.config.response_timeout, async {
            loop {
                match frames.recv().await {
                    Ok(seen)
                        if seen.direction == Direction::FromDevice
                            && seen.ticket == Some(ticket) =>
                    {
                        return Ok(seen.bytes);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(Error::ChannelClosed),
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout)??;
        drop(lease);

        let mut registers: heapless::Vec<u16, 64> = heapless::Vec::new();
        request.parse_u16(&response, &mut registers)?;
        LiveStatus::from_registers(&registers, self.config.start_register, &self.config.scaling)
    }

    /// Poll on every tick while someone is subscribed.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.updates.receiver_count() == 0 {
                continue;
            }
            match self.poll_once().await {
                Ok(status) => {
                    let _ = self.updates.send(status);
                }
                Err(Error::Busy) => trace!("channel busy, status tick skipped"),
                Err(err) => debug!(%err, "status read failed"),
            }
        }
    }
}
