//! Precharge completion strategies
//!
//! While the manager sits in `ClosingPositive` it asks the active strategy
//! each tick whether the HV bus is charged far enough to close the positive
//! contactor. [`TimedDelay`] waits a fixed time; [`VoltageMatch`] compares the
//! pack voltage against the HV bus voltage.

use crate::bms::contactor_manager::{ManagerDtc, ManagerTiming};
use crate::clock::{elapsed_ms, Millis};
use crate::settings::{ContactorSettings, SettingsError, CONTACTOR_PRCHG_TIME_MS};

/// A pushed voltage reading and the time it arrived
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VoltageSample {
    pub volts: f32,
    pub timestamp: Millis,
}

impl VoltageSample {
    /// Whether the sample is at most `window_ms` old at `now`
    pub fn is_fresh(&self, now: Millis, window_ms: u32) -> bool {
        elapsed_ms(now, self.timestamp) <= window_ms
    }
}

/// What a strategy sees on each poll
#[derive(Debug, Clone, Copy)]
pub struct PrechargeContext {
    pub now: Millis,
    /// Time since the precharge contactor reported closed
    pub elapsed_ms: u32,
    pub hv_bus: Option<VoltageSample>,
    pub pack: Option<VoltageSample>,
}

/// Outcome of one strategy poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PrechargeVerdict {
    /// Keep precharging
    Wait,
    /// Precharge complete, close the positive contactor
    ClosePositive,
    /// Precharge failed with this manager DTC
    Fault(ManagerDtc),
}

/// Decides when precharge is complete
pub trait PrechargeStrategy {
    fn poll(&self, ctx: &PrechargeContext) -> PrechargeVerdict;
}

/// Persisted strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StrategyKind {
    TimedDelay = 0,
    VoltageMatch = 1,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TimedDelay => "TIMED_DELAY",
            Self::VoltageMatch => "VOLTAGE_MATCH",
        }
    }
}

impl TryFrom<u8> for StrategyKind {
    type Error = SettingsError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::TimedDelay),
            1 => Ok(Self::VoltageMatch),
            other => Err(SettingsError::UnknownStrategy(other)),
        }
    }
}

/// Closes the positive contactor a fixed time after precharge closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedDelay {
    pub precharge_time_ms: u32,
}

impl Default for TimedDelay {
    fn default() -> Self {
        Self {
            precharge_time_ms: CONTACTOR_PRCHG_TIME_MS,
        }
    }
}

impl PrechargeStrategy for TimedDelay {
    fn poll(&self, ctx: &PrechargeContext) -> PrechargeVerdict {
        if ctx.elapsed_ms > self.precharge_time_ms {
            PrechargeVerdict::ClosePositive
        } else {
            PrechargeVerdict::Wait
        }
    }
}

/// Closes the positive contactor once the HV bus has charged to the pack voltage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageMatch {
    /// Allowed |pack - bus| difference (V)
    pub tolerance: f32,
    /// Mismatch persisting longer than this faults
    pub timeout_ms: u32,
    pub hv_bus_validity_ms: u32,
    pub pack_validity_ms: u32,
    pub hv_bus_missing_timeout_ms: u32,
    pub pack_missing_timeout_ms: u32,
}

impl VoltageMatch {
    /// Builds the strategy from runtime tuning and the manager's sample windows
    pub fn from_settings(settings: &ContactorSettings, timing: &ManagerTiming) -> Self {
        Self {
            tolerance: settings.voltage_match_tolerance,
            timeout_ms: settings.voltage_match_timeout_ms,
            hv_bus_validity_ms: timing.hv_bus_validity_ms,
            pack_validity_ms: timing.pack_validity_ms,
            hv_bus_missing_timeout_ms: timing.hv_bus_missing_timeout_ms,
            pack_missing_timeout_ms: timing.pack_missing_timeout_ms,
        }
    }
}

impl PrechargeStrategy for VoltageMatch {
    fn poll(&self, ctx: &PrechargeContext) -> PrechargeVerdict {
        let hv_bus = ctx
            .hv_bus
            .filter(|s| s.is_fresh(ctx.now, self.hv_bus_validity_ms));
        let pack = ctx.pack.filter(|s| s.is_fresh(ctx.now, self.pack_validity_ms));

        match (hv_bus, pack) {
            (None, _) if ctx.elapsed_ms > self.hv_bus_missing_timeout_ms => {
                PrechargeVerdict::Fault(ManagerDtc::EXTERNAL_HV_MISSING)
            }
            (_, None) if ctx.elapsed_ms > self.pack_missing_timeout_ms => {
                PrechargeVerdict::Fault(ManagerDtc::PACK_VOLTAGE_MISSING)
            }
            (Some(bus), Some(pack)) => {
                let difference = libm::fabsf(pack.volts - bus.volts);
                if difference <= self.tolerance {
                    PrechargeVerdict::ClosePositive
                } else if ctx.elapsed_ms > self.timeout_ms {
                    PrechargeVerdict::Fault(ManagerDtc::VOLTAGE_MATCH_TIMEOUT)
                } else {
                    PrechargeVerdict::Wait
                }
            }
            _ => PrechargeVerdict::Wait,
        }
    }
}

/// The configured strategy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    TimedDelay(TimedDelay),
    VoltageMatch(VoltageMatch),
}

impl Strategy {
    /// Builds the strategy selected in `settings`
    pub fn from_settings(settings: &ContactorSettings, timing: &ManagerTiming) -> Self {
        match settings.strategy {
            StrategyKind::TimedDelay => Self::TimedDelay(TimedDelay {
                precharge_time_ms: timing.precharge_time_ms,
            }),
            StrategyKind::VoltageMatch => {
                Self::VoltageMatch(VoltageMatch::from_settings(settings, timing))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::TimedDelay(_) => StrategyKind::TimedDelay,
            Self::VoltageMatch(_) => StrategyKind::VoltageMatch,
        }
    }
}

impl PrechargeStrategy for Strategy {
    fn poll(&self, ctx: &PrechargeContext) -> PrechargeVerdict {
        match self {
            Self::TimedDelay(s) => s.poll(ctx),
            Self::VoltageMatch(s) => s.poll(ctx),
        }
    }
}
