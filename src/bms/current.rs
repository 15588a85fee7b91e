//! Pack current sensor
//!
//! [`Shunt`] turns raw current samples into the signals the rest of the BMS
//! consumes: the latest current, a one second moving average, its derivative
//! and the ampere-seconds integrated since boot. Positive current charges the
//! pack.

use core::fmt;

use bitflags::bitflags;

use crate::clock::{elapsed_ms, Clock, Millis};
use crate::settings::{SHUNT_MAX_CURRENT_A, SHUNT_TIMEOUT_MS};

/// Averaging window of the moving average (s)
const AVERAGE_WINDOW_S: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ShuntState {
    /// No sample received yet
    Init,
    Operating,
    /// Latched until [`Shunt::reset`]
    Fault,
}

impl ShuntState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Operating => "OPERATING",
            Self::Fault => "FAULT",
        }
    }
}

bitflags! {
    /// Latched current sensor faults
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShuntDtc: u8 {
        /// |current| above the plausible maximum
        const MAX_CURRENT_EXCEEDED = 1 << 0;
        /// No sample within the timeout
        const TIMED_OUT = 1 << 1;
        /// Sample was NaN or infinite
        const INVALID_SAMPLE = 1 << 2;
    }
}

impl fmt::Display for ShuntDtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        super::write_flag_names(f, self.iter_names())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ShuntDtc {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ShuntDtc({=u8:#x})", self.bits())
    }
}

/// Published current sensor signals
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ShuntReading {
    /// Latest current (A)
    pub current: f32,
    /// Moving average over one second (A)
    pub current_average: f32,
    /// Rate of change (A/s)
    pub current_derivative: f32,
    /// Charge integrated since boot (As)
    pub accumulated_charge: f32,
    /// Sensor is faulted; the other fields must not be trusted
    pub fault: bool,
}

/// Current integrator fed by the ADC or CAN sensor task
pub struct Shunt<C> {
    clock: C,
    state: ShuntState,
    dtc: ShuntDtc,
    timeout_ms: u32,
    max_current: f32,
    current: f32,
    current_average: f32,
    current_derivative: f32,
    accumulated_charge: f32,
    last_sample: Option<Millis>,
}

impl<C: Clock> Shunt<C> {
    pub fn new(clock: C) -> Self {
        Self::with_limits(clock, SHUNT_TIMEOUT_MS, SHUNT_MAX_CURRENT_A)
    }

    pub fn with_limits(clock: C, timeout_ms: u32, max_current: f32) -> Self {
        Self {
            clock,
            state: ShuntState::Init,
            dtc: ShuntDtc::empty(),
            timeout_ms,
            max_current,
            current: 0.0,
            current_average: 0.0,
            current_derivative: 0.0,
            accumulated_charge: 0.0,
            last_sample: None,
        }
    }

    /// Feeds one current sample (A)
    pub fn on_sample(&mut self, current: f32) {
        if self.state == ShuntState::Fault {
            return;
        }
        if !current.is_finite() {
            self.raise(ShuntDtc::INVALID_SAMPLE);
            return;
        }
        if libm::fabsf(current) > self.max_current {
            self.raise(ShuntDtc::MAX_CURRENT_EXCEEDED);
            return;
        }

        let now = self.clock.now_ms();
        match self.last_sample {
            None => {
                self.current_average = current;
                info!("shunt: first sample {}A", current);
                self.state = ShuntState::Operating;
            }
            Some(last) => {
                let dt = elapsed_ms(now, last) as f32 / 1000.0;
                if dt > 0.0 {
                    // trapezoidal integration
                    self.accumulated_charge += (self.current + current) * 0.5 * dt;
                    self.current_derivative = (current - self.current) / dt;
                    let alpha = (dt / AVERAGE_WINDOW_S).min(1.0);
                    self.current_average += alpha * (current - self.current_average);
                }
            }
        }
        self.current = current;
        self.last_sample = Some(now);
    }

    /// Periodic supervision, raises `TIMED_OUT` when samples stop arriving
    pub fn update(&mut self) {
        if self.state != ShuntState::Operating {
            return;
        }
        if let Some(last) = self.last_sample {
            if elapsed_ms(self.clock.now_ms(), last) > self.timeout_ms {
                self.raise(ShuntDtc::TIMED_OUT);
            }
        }
    }

    /// Clears a latched fault. The integrated charge is kept.
    pub fn reset(&mut self) {
        self.dtc = ShuntDtc::empty();
        self.last_sample = None;
        self.state = ShuntState::Init;
    }

    pub fn state(&self) -> ShuntState {
        self.state
    }

    pub fn dtc(&self) -> ShuntDtc {
        self.dtc
    }

    pub fn reading(&self) -> ShuntReading {
        ShuntReading {
            current: self.current,
            current_average: self.current_average,
            current_derivative: self.current_derivative,
            accumulated_charge: self.accumulated_charge,
            fault: self.state == ShuntState::Fault,
        }
    }

    fn raise(&mut self, dtc: ShuntDtc) {
        self.dtc |= dtc;
        if self.state != ShuntState::Fault {
            error!("shunt: fault {} in {}", dtc, self.state.as_str());
            self.state = ShuntState::Fault;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::TestClock;

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-3,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn integrates_trapezoids() {
        let clock = TestClock::at(0);
        let mut shunt = Shunt::new(&clock);
        shunt.on_sample(10.0);
        assert_eq!(shunt.state(), ShuntState::Operating);
        clock.advance(1_000);
        shunt.on_sample(20.0);
        clock.advance(500);
        shunt.on_sample(20.0);

        let reading = shunt.reading();
        assert_close(reading.accumulated_charge, 15.0 + 10.0);
        assert_close(reading.current, 20.0);
        assert_close(reading.current_derivative, 0.0);
        assert!(!reading.fault);
    }

    #[test]
    fn derivative_and_average_follow_step() {
        let clock = TestClock::at(0);
        let mut shunt = Shunt::new(&clock);
        shunt.on_sample(0.0);
        clock.advance(100);
        shunt.on_sample(-10.0);
        let reading = shunt.reading();
        assert_close(reading.current_derivative, -100.0);
        assert_close(reading.current_average, -1.0);
        assert_close(reading.accumulated_charge, -0.5);
    }

    #[test]
    fn silence_times_out() {
        let clock = TestClock::at(0);
        let mut shunt = Shunt::new(&clock);
        shunt.update();
        assert_eq!(shunt.state(), ShuntState::Init);

        shunt.on_sample(1.0);
        clock.advance(100);
        shunt.update();
        assert_eq!(shunt.state(), ShuntState::Operating);
        clock.advance(1);
        shunt.update();
        assert_eq!(shunt.state(), ShuntState::Fault);
        assert_eq!(shunt.dtc(), ShuntDtc::TIMED_OUT);
        assert!(shunt.reading().fault);

        // samples are ignored until reset
        shunt.on_sample(5.0);
        assert_eq!(shunt.reading().current, 1.0);
        shunt.reset();
        shunt.on_sample(5.0);
        assert_eq!(shunt.state(), ShuntState::Operating);
        assert_eq!(shunt.reading().current, 5.0);
    }

    #[test]
    fn implausible_samples_fault() {
        let clock = TestClock::at(0);
        let mut shunt = Shunt::new(&clock);
        shunt.on_sample(f32::NAN);
        assert_eq!(shunt.dtc(), ShuntDtc::INVALID_SAMPLE);

        let mut shunt = Shunt::new(&clock);
        shunt.on_sample(-600.0);
        assert_eq!(shunt.dtc(), ShuntDtc::MAX_CURRENT_EXCEEDED);
        assert_eq!(shunt.reading().accumulated_charge, 0.0);
    }
}
