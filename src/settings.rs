//! Firmware settings
//!
//! Compile-time constants for loop periods, contactor timing and the charge
//! estimator, plus the small set of contactor tuning values that can be
//! changed at runtime and are kept in flash.

use core::fmt;

use crate::bms::precharge::StrategyKind;

//------------------------------------------------------------------------------
// Contactor manager
//------------------------------------------------------------------------------

/// Contactor task period
pub const CONTACTOR_TIMELOOP_MS: u32 = 20;

/// Time a contactor may take to confirm a commanded transition
pub const CONTACTOR_TIMEOUT_MS: u32 = 200;

/// Feedback is ignored for this long after a command. Must exceed the loop period.
pub const CONTACTOR_DEBOUNCE_MS: u32 = 100;

/// Time the precharge contactor stays closed before the positive contactor
/// closes (timed strategy) and stays closed after it opens
pub const CONTACTOR_PRCHG_TIME_MS: u32 = 2000;

/// A pushed HV bus sample is trusted for this long
pub const HV_BUS_VOLTAGE_VALIDITY_MS: u32 = 500;

/// A pushed pack voltage sample is trusted for this long
pub const PACK_VOLTAGE_VALIDITY_MS: u32 = 500;

/// Precharge gives up when no usable HV bus sample arrives within this time
pub const HV_BUS_MISSING_TIMEOUT_MS: u32 = 3000;

/// Precharge gives up when no usable pack voltage sample arrives within this time
pub const PACK_VOLTAGE_MISSING_TIMEOUT_MS: u32 = 3000;

/// Default allowed pack/bus difference before closing the positive contactor (V)
pub const VOLTAGE_MATCH_TOLERANCE_V: f32 = 15.0;

/// Default time allowed for the bus to reach the pack voltage
pub const VOLTAGE_MATCH_TIMEOUT_MS: u32 = 5000;

/// Accepted range for the runtime tolerance (V)
pub const VOLTAGE_MATCH_TOLERANCE_RANGE: (f32, f32) = (0.5, 100.0);

/// Accepted range for the runtime voltage match timeout (ms)
pub const VOLTAGE_MATCH_TIMEOUT_RANGE_MS: (u32, u32) = (100, 60_000);

//------------------------------------------------------------------------------
// Pack
//------------------------------------------------------------------------------

/// Cells in series (8 modules x 12 cells)
pub const CELLS_IN_SERIES: u32 = 96;

/// Pack voltages below this are treated as a disconnected sense line (V)
pub const PACK_VOLTAGE_MIN_PLAUSIBLE_V: f32 = 150.0;

/// Pack voltages above this are treated as a measurement fault (V)
pub const PACK_VOLTAGE_MAX_PLAUSIBLE_V: f32 = 450.0;

//------------------------------------------------------------------------------
// Current sensor
//------------------------------------------------------------------------------

/// Current sensor is faulted when no sample arrives within this time
pub const SHUNT_TIMEOUT_MS: u32 = 100;

/// Absolute current above which the sensor reading is treated as faulted (A)
pub const SHUNT_MAX_CURRENT_A: f32 = 500.0;

//------------------------------------------------------------------------------
// Charge estimator
//------------------------------------------------------------------------------

/// Charge estimator task period
pub const CHARGE_TIMELOOP_MS: u32 = 1000;

/// The estimator seed is written to flash this often (s)
pub const CHARGE_SAVE_INTERVAL_S: u32 = 60;

/// Rated pack capacity: 94 Ah in ampere-seconds
pub const RATED_CAPACITY_AS: f32 = 94.0 * 3600.0;

/// Capacity assumed when nothing has been stored yet
pub const INITIAL_CAPACITY_AS: f32 = RATED_CAPACITY_AS;

/// Gain applied when nudging the charge offset toward an OCV anchor
pub const CC_K_GAIN: f32 = 0.1;

/// Below this absolute current the pack counts as resting (A)
pub const CC_REST_THRESHOLD_A: f32 = 10.0;

/// Rest time before cell voltages are trusted as OCV (s)
pub const CC_REST_TIME_MIN_S: f32 = 15.0;

/// Upper SOC threshold for anchoring and recalibration
pub const CC_SOC_HIGH_THRESHOLD: f32 = 0.80;

/// Lower SOC threshold for anchoring and recalibration
pub const CC_SOC_LOW_THRESHOLD: f32 = 0.20;

/// Weight of a freshly measured capacity in the blended estimate
pub const CC_ALPHA: f32 = 0.5;

/// Measured capacities outside this fraction of rated are discarded
pub const CC_CAPACITY_PLAUSIBLE_RANGE: (f32, f32) = (0.30, 1.50);

//------------------------------------------------------------------------------
// Runtime tuning
//------------------------------------------------------------------------------

/// Rejected tuning value
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SettingsError {
    /// Tolerance outside [`VOLTAGE_MATCH_TOLERANCE_RANGE`]
    ToleranceOutOfRange(f32),
    /// Timeout outside [`VOLTAGE_MATCH_TIMEOUT_RANGE_MS`]
    TimeoutOutOfRange(u32),
    /// Strategy selector does not name a strategy
    UnknownStrategy(u8),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToleranceOutOfRange(v) => write!(
                f,
                "tolerance {v:.2}V outside {:.1}..{:.1}V",
                VOLTAGE_MATCH_TOLERANCE_RANGE.0, VOLTAGE_MATCH_TOLERANCE_RANGE.1
            ),
            Self::TimeoutOutOfRange(ms) => write!(
                f,
                "timeout {ms}ms outside {}..{}ms",
                VOLTAGE_MATCH_TIMEOUT_RANGE_MS.0, VOLTAGE_MATCH_TIMEOUT_RANGE_MS.1
            ),
            Self::UnknownStrategy(raw) => write!(f, "unknown precharge strategy {raw}"),
        }
    }
}

/// Contactor tuning kept in flash and adjustable from the console
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContactorSettings {
    /// How the precharge phase decides it is complete
    pub strategy: StrategyKind,
    /// Allowed |pack - bus| difference for the voltage match strategy (V)
    pub voltage_match_tolerance: f32,
    /// Time allowed for the bus to match the pack (ms)
    pub voltage_match_timeout_ms: u32,
}

impl Default for ContactorSettings {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::TimedDelay,
            voltage_match_tolerance: VOLTAGE_MATCH_TOLERANCE_V,
            voltage_match_timeout_ms: VOLTAGE_MATCH_TIMEOUT_MS,
        }
    }
}

impl ContactorSettings {
    /// Checks every field against its accepted range
    pub fn validate(&self) -> Result<(), SettingsError> {
        let (lo, hi) = VOLTAGE_MATCH_TOLERANCE_RANGE;
        // written so NaN fails as well
        if !(self.voltage_match_tolerance >= lo && self.voltage_match_tolerance <= hi) {
            return Err(SettingsError::ToleranceOutOfRange(self.voltage_match_tolerance));
        }
        let (lo, hi) = VOLTAGE_MATCH_TIMEOUT_RANGE_MS;
        if !(lo..=hi).contains(&self.voltage_match_timeout_ms) {
            return Err(SettingsError::TimeoutOutOfRange(self.voltage_match_timeout_ms));
        }
        Ok(())
    }

    /// Copy with a new voltage match tolerance, if it is in range
    pub fn with_tolerance(self, volts: f32) -> Result<Self, SettingsError> {
        let updated = Self {
            voltage_match_tolerance: volts,
            ..self
        };
        updated.validate().map(|()| updated)
    }

    /// Copy with a new voltage match timeout, if it is in range
    pub fn with_timeout(self, timeout_ms: u32) -> Result<Self, SettingsError> {
        let updated = Self {
            voltage_match_timeout_ms: timeout_ms,
            ..self
        };
        updated.validate().map(|()| updated)
    }

    /// Copy with a different precharge strategy
    pub fn with_strategy(self, strategy: StrategyKind) -> Self {
        Self { strategy, ..self }
    }
}
