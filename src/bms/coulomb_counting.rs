//! Charge and state of charge estimation
//!
//! Coulomb counting on top of the current sensor's integrated charge, with two
//! corrections:
//!
//! - **OCV anchor**: after the pack has rested long enough, cell voltages near
//!   either end of the SOC range are trusted as open circuit voltages and the
//!   charge offset is nudged towards the SOC they imply.
//! - **Capacity recalibration**: a rise through the low threshold followed by
//!   a rise above and fall back below the high threshold gives a measured
//!   capacity, blended into the estimate.
//!
//! The estimator survives resets through [`ChargeEstimatorSeed`], which the
//! firmware stores in flash.

use crate::bms::current::ShuntReading;
use crate::bms::soc_lookup::OcvLookup;
use crate::clock::{elapsed_ms, Clock, Millis};
use crate::settings::{
    CC_ALPHA, CC_CAPACITY_PLAUSIBLE_RANGE, CC_K_GAIN, CC_REST_THRESHOLD_A, CC_REST_TIME_MIN_S,
    CC_SOC_HIGH_THRESHOLD, CC_SOC_LOW_THRESHOLD, INITIAL_CAPACITY_AS, RATED_CAPACITY_AS,
};

/// Estimator tuning
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EstimatorConfig {
    /// Nameplate capacity (As)
    pub rated_capacity: f32,
    /// Fraction of the SOC error corrected per anchor
    pub k_gain: f32,
    /// Below this |current| the pack is resting (A)
    pub rest_threshold: f32,
    /// Rest needed before cell voltages count as OCV (s)
    pub rest_time_min_s: f32,
    pub soc_high_threshold: f32,
    pub soc_low_threshold: f32,
    /// Weight of a new capacity measurement
    pub alpha: f32,
    /// Accepted measured capacity as a fraction of rated
    pub capacity_plausible_range: (f32, f32),
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            rated_capacity: RATED_CAPACITY_AS,
            k_gain: CC_K_GAIN,
            rest_threshold: CC_REST_THRESHOLD_A,
            rest_time_min_s: CC_REST_TIME_MIN_S,
            soc_high_threshold: CC_SOC_HIGH_THRESHOLD,
            soc_low_threshold: CC_SOC_LOW_THRESHOLD,
            alpha: CC_ALPHA,
            capacity_plausible_range: CC_CAPACITY_PLAUSIBLE_RANGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EstimatorState {
    Init,
    Operating,
    /// Current sensor faulted; the estimate is frozen until re-initialised
    Fault,
}

impl EstimatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Operating => "OPERATING",
            Self::Fault => "FAULT",
        }
    }
}

/// Persisted estimator parameters
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargeEstimatorSeed {
    /// Estimated usable capacity (As)
    pub capacity_estimate: f32,
    /// Charge in the pack when the current sensor integral was zero (As)
    pub accumulated_charge_init: f32,
    pub recalibration_active: bool,
    pub recalibration_start_charge: f32,
}

impl Default for ChargeEstimatorSeed {
    /// Rated capacity at half charge
    fn default() -> Self {
        Self {
            capacity_estimate: INITIAL_CAPACITY_AS,
            accumulated_charge_init: 0.5 * INITIAL_CAPACITY_AS,
            recalibration_active: false,
            recalibration_start_charge: 0.0,
        }
    }
}

/// Cell extremes from the module monitors
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CellSummary {
    pub cell_voltage_min: f32,
    pub cell_voltage_max: f32,
    /// °C
    pub average_temperature: f32,
}

/// Value snapshot of the estimator, published for the console
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargeStatus {
    pub state: EstimatorState,
    pub soc_coulomb: f32,
    pub soc_corrected: f32,
    pub state_of_health: f32,
    pub capacity_estimate: f32,
    pub charge_offset: f32,
    pub accumulated_charge_init: f32,
    pub session_accumulated_charge: f32,
    pub total_charge: f32,
    pub rest_timer_s: f32,
    pub recalibration_active: bool,
    pub recalibration_start_charge: f32,
}

/// Coulomb counting SOC estimator with OCV anchoring and capacity learning
pub struct ChargeEstimator<L, C> {
    lookup: L,
    clock: C,
    config: EstimatorConfig,
    state: EstimatorState,
    capacity_estimate: f32,
    charge_offset: f32,
    accumulated_charge_init: f32,
    session_accumulated_charge: f32,
    soc_coulomb: f32,
    soc_corrected: f32,
    soc_corrected_previous: f32,
    state_of_health: f32,
    rest_timer: f32,
    recalibration_active: bool,
    recalibration_start_charge: f32,
    last_update: Option<Millis>,
}

impl<L: OcvLookup, C: Clock> ChargeEstimator<L, C> {
    pub fn new(lookup: L, config: EstimatorConfig, clock: C) -> Self {
        Self {
            lookup,
            clock,
            config,
            state: EstimatorState::Init,
            capacity_estimate: 0.0,
            charge_offset: 0.0,
            accumulated_charge_init: 0.0,
            session_accumulated_charge: 0.0,
            soc_coulomb: 0.0,
            soc_corrected: 0.0,
            soc_corrected_previous: 0.0,
            state_of_health: 0.0,
            rest_timer: 0.0,
            recalibration_active: false,
            recalibration_start_charge: 0.0,
            last_update: None,
        }
    }

    /// Loads persisted parameters. With a positive capacity the estimator
    /// starts `Operating`, otherwise it stays in `Init`.
    pub fn initialise(&mut self, seed: ChargeEstimatorSeed) {
        self.capacity_estimate = seed.capacity_estimate;
        self.accumulated_charge_init = seed.accumulated_charge_init;
        self.recalibration_active = seed.recalibration_active;
        self.recalibration_start_charge = seed.recalibration_start_charge;
        self.charge_offset = 0.0;
        self.session_accumulated_charge = 0.0;
        self.rest_timer = 0.0;
        self.last_update = None;
        self.update_state_of_health();

        if self.capacity_estimate > 0.0 {
            self.soc_coulomb = self.soc_of(self.accumulated_charge_init);
            self.soc_corrected = self.soc_coulomb;
            self.state = EstimatorState::Operating;
        } else {
            self.soc_coulomb = 0.0;
            self.soc_corrected = 0.0;
            self.state = EstimatorState::Init;
        }
        self.soc_corrected_previous = self.soc_corrected;
        info!(
            "charge estimator: capacity {}As soc {} ({})",
            self.capacity_estimate,
            self.soc_corrected,
            self.state.as_str()
        );
    }

    /// Periodic estimation, called once per charge tick. `cells` is `None`
    /// while no cell data is available, which disables OCV anchoring.
    pub fn update(&mut self, cells: Option<&CellSummary>, shunt: &ShuntReading) {
        if shunt.fault {
            if self.state != EstimatorState::Fault {
                error!("charge estimator: current sensor fault, estimate frozen");
                self.state = EstimatorState::Fault;
            }
            return;
        }

        match self.state {
            EstimatorState::Fault => return,
            EstimatorState::Init => {
                if self.capacity_estimate > 0.0 {
                    self.state = EstimatorState::Operating;
                } else {
                    return;
                }
            }
            EstimatorState::Operating => {}
        }

        let now = self.clock.now_ms();
        let Some(last) = self.last_update.replace(now) else {
            return;
        };
        let dt_ms = elapsed_ms(now, last);
        if dt_ms == 0 {
            return;
        }
        let dt_s = dt_ms as f32 / 1000.0;

        self.session_accumulated_charge = shunt.accumulated_charge;
        let total = self.total_charge();
        self.soc_coulomb = self.soc_of(total);
        self.soc_corrected = self.soc_of(total + self.charge_offset);

        if libm::fabsf(shunt.current) < self.config.rest_threshold {
            self.rest_timer += dt_s;
        } else {
            self.rest_timer = 0.0;
        }

        if self.rest_timer > self.config.rest_time_min_s {
            if let Some(anchor) = cells.and_then(|cells| self.ocv_anchor(cells)) {
                let correction =
                    self.config.k_gain * (anchor - self.soc_corrected) * self.capacity_estimate;
                self.charge_offset += correction;
                self.soc_corrected = self.soc_of(total + self.charge_offset);
                debug!(
                    "charge estimator: ocv anchor {} offset {}As",
                    anchor, self.charge_offset
                );
            }
        }

        self.track_recalibration(total);
        self.soc_corrected_previous = self.soc_corrected;
    }

    /// Parameters to persist. The OCV offset is folded into the saved charge
    /// baseline and the recalibration start so a restart reproduces the
    /// corrected SOC.
    pub fn seed(&self) -> ChargeEstimatorSeed {
        ChargeEstimatorSeed {
            capacity_estimate: self.capacity_estimate,
            accumulated_charge_init: self.total_charge() + self.charge_offset,
            recalibration_active: self.recalibration_active,
            recalibration_start_charge: self.recalibration_start_charge + self.charge_offset,
        }
    }

    pub fn state(&self) -> EstimatorState {
        self.state
    }

    pub fn soc_corrected(&self) -> f32 {
        self.soc_corrected
    }

    pub fn soc_coulomb(&self) -> f32 {
        self.soc_coulomb
    }

    pub fn capacity_estimate(&self) -> f32 {
        self.capacity_estimate
    }

    pub fn state_of_health(&self) -> f32 {
        self.state_of_health
    }

    pub fn status(&self) -> ChargeStatus {
        ChargeStatus {
            state: self.state,
            soc_coulomb: self.soc_coulomb,
            soc_corrected: self.soc_corrected,
            state_of_health: self.state_of_health,
            capacity_estimate: self.capacity_estimate,
            charge_offset: self.charge_offset,
            accumulated_charge_init: self.accumulated_charge_init,
            session_accumulated_charge: self.session_accumulated_charge,
            total_charge: self.total_charge(),
            rest_timer_s: self.rest_timer,
            recalibration_active: self.recalibration_active,
            recalibration_start_charge: self.recalibration_start_charge,
        }
    }

    fn total_charge(&self) -> f32 {
        self.accumulated_charge_init + self.session_accumulated_charge
    }

    fn soc_of(&self, charge: f32) -> f32 {
        let soc = charge / self.capacity_estimate;
        // clamp passes NaN through
        if soc.is_nan() {
            0.0
        } else {
            soc.clamp(0.0, 1.0)
        }
    }

    /// SOC implied by the highest or lowest cell, if either is near an end
    fn ocv_anchor(&self, cells: &CellSummary) -> Option<f32> {
        let temperature = cells.average_temperature;
        let soc_high = self.lookup.soc_from_ocv(temperature, cells.cell_voltage_max);
        let soc_low = self.lookup.soc_from_ocv(temperature, cells.cell_voltage_min);
        if soc_high > self.config.soc_high_threshold {
            Some(soc_high)
        } else if soc_low < self.config.soc_low_threshold {
            Some(soc_low)
        } else {
            None
        }
    }

    fn track_recalibration(&mut self, total: f32) {
        let low = self.config.soc_low_threshold;
        let high = self.config.soc_high_threshold;
        let previous = self.soc_corrected_previous;
        let soc = self.soc_corrected;

        if previous < low && soc >= low {
            self.recalibration_active = true;
            self.recalibration_start_charge = total;
            info!("charge estimator: recalibration started at {}As", total);
        } else if self.recalibration_active && previous >= high && soc < high {
            self.recalibration_active = false;
            let span = soc - low;
            if span <= 0.0 {
                return;
            }
            let measured = (total - self.recalibration_start_charge) / span;
            let (min, max) = self.config.capacity_plausible_range;
            let rated = self.config.rated_capacity;
            if measured >= min * rated && measured <= max * rated {
                let alpha = self.config.alpha;
                self.capacity_estimate = alpha * measured + (1.0 - alpha) * self.capacity_estimate;
                self.update_state_of_health();
                info!(
                    "charge estimator: measured {}As, capacity now {}As (soh {})",
                    measured, self.capacity_estimate, self.state_of_health
                );
            } else {
                warn!("charge estimator: implausible capacity {}As discarded", measured);
            }
        }
    }

    fn update_state_of_health(&mut self) {
        self.state_of_health = if self.config.rated_capacity > 0.0 {
            self.capacity_estimate / self.config.rated_capacity
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bms::soc_lookup::CELL_OCV_TABLE;
    use crate::clock::testing::TestClock;

    /// Lookup that never produces an anchor
    struct MidRange;

    impl OcvLookup for MidRange {
        fn soc_from_ocv(&self, _temperature: f32, _cell_voltage: f32) -> f32 {
            0.5
        }
    }

    const CAPACITY: f32 = 100_000.0;

    fn config() -> EstimatorConfig {
        EstimatorConfig {
            rated_capacity: CAPACITY,
            ..EstimatorConfig::default()
        }
    }

    fn seed(soc: f32) -> ChargeEstimatorSeed {
        ChargeEstimatorSeed {
            capacity_estimate: CAPACITY,
            accumulated_charge_init: soc * CAPACITY,
            recalibration_active: false,
            recalibration_start_charge: 0.0,
        }
    }

    fn reading(accumulated_charge: f32, current: f32) -> ShuntReading {
        ShuntReading {
            current,
            accumulated_charge,
            ..ShuntReading::default()
        }
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-4,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn initialise_computes_soc_and_health() {
        let clock = TestClock::at(0);
        let mut estimator = ChargeEstimator::new(MidRange, config(), &clock);
        estimator.initialise(seed(0.4));
        assert_eq!(estimator.state(), EstimatorState::Operating);
        assert_close(estimator.soc_corrected(), 0.4);
        assert_close(estimator.state_of_health(), 1.0);

        estimator.initialise(ChargeEstimatorSeed {
            capacity_estimate: 0.0,
            ..seed(0.4)
        });
        assert_eq!(estimator.state(), EstimatorState::Init);
        estimator.update(None, &reading(0.0, 0.0));
        assert_eq!(estimator.state(), EstimatorState::Init);
    }

    #[test]
    fn first_update_only_starts_the_clock() {
        let clock = TestClock::at(500);
        let mut estimator = ChargeEstimator::new(MidRange, config(), &clock);
        estimator.initialise(seed(0.5));
        estimator.update(None, &reading(10_000.0, 5.0));
        assert_close(estimator.soc_coulomb(), 0.5);

        // no elapsed time, no change
        estimator.update(None, &reading(10_000.0, 5.0));
        assert_close(estimator.soc_coulomb(), 0.5);

        clock.advance(1_000);
        estimator.update(None, &reading(10_000.0, 5.0));
        assert_close(estimator.soc_coulomb(), 0.6);
        assert_close(estimator.soc_corrected(), 0.6);
    }

    #[test]
    fn soc_stays_in_bounds() {
        let clock = TestClock::at(0);
        let mut estimator = ChargeEstimator::new(CELL_OCV_TABLE, config(), &clock);
        estimator.initialise(seed(0.5));
        let cells = CellSummary {
            cell_voltage_min: 2.0,
            cell_voltage_max: 4.5,
            average_temperature: -40.0,
        };
        for (i, charge) in [-1e9_f32, 1e9, 0.0, -5e4, 3e5, f32::MAX, f32::MIN]
            .into_iter()
            .cycle()
            .take(120)
            .enumerate()
        {
            clock.advance(1_000);
            let current = if i % 3 == 0 { 400.0 } else { 0.0 };
            estimator.update(Some(&cells), &reading(charge, current));
            let status = estimator.status();
            assert!((0.0..=1.0).contains(&status.soc_coulomb));
            assert!((0.0..=1.0).contains(&status.soc_corrected));
        }
    }

    #[test]
    fn rested_high_cell_anchors_the_offset() {
        let clock = TestClock::at(0);
        let mut estimator = ChargeEstimator::new(CELL_OCV_TABLE, config(), &clock);
        estimator.initialise(seed(0.5));
        let cells = CellSummary {
            cell_voltage_min: 4.0,
            cell_voltage_max: 4.10,
            average_temperature: 25.0,
        };

        estimator.update(Some(&cells), &reading(0.0, 0.0));
        for _ in 0..15 {
            clock.advance(1_000);
            estimator.update(Some(&cells), &reading(0.0, 1.0));
        }
        assert_eq!(estimator.status().charge_offset, 0.0);

        clock.advance(1_000);
        estimator.update(Some(&cells), &reading(0.0, 1.0));
        let anchor = 0.9756;
        let status = estimator.status();
        assert!((status.charge_offset - 0.1 * (anchor - 0.5) * CAPACITY).abs() < 0.1);
        assert_close(status.soc_corrected, 0.5 + 0.1 * (anchor - 0.5));
        assert_close(status.soc_coulomb, 0.5);
    }

    #[test]
    fn load_current_resets_rest_timer() {
        let clock = TestClock::at(0);
        let mut estimator = ChargeEstimator::new(CELL_OCV_TABLE, config(), &clock);
        estimator.initialise(seed(0.5));
        let cells = CellSummary {
            cell_voltage_min: 3.36,
            cell_voltage_max: 3.40,
            average_temperature: 25.0,
        };
        estimator.update(Some(&cells), &reading(0.0, 0.0));
        for i in 0..40 {
            clock.advance(1_000);
            let current = if i % 10 == 9 { -50.0 } else { 0.0 };
            estimator.update(Some(&cells), &reading(0.0, current));
        }
        assert_eq!(estimator.status().charge_offset, 0.0);
    }

    #[test]
    fn full_cycle_blends_measured_capacity() {
        let clock = TestClock::at(0);
        let mut estimator = ChargeEstimator::new(MidRange, config(), &clock);
        estimator.initialise(seed(0.1));
        estimator.update(None, &reading(0.0, 50.0));

        // 0.10 -> 0.25 crosses the low threshold
        clock.advance(1_000);
        estimator.update(None, &reading(15_000.0, 50.0));
        let status = estimator.status();
        assert!(status.recalibration_active);
        assert_close(status.recalibration_start_charge, 25_000.0);

        // up to 0.85, then back down to 0.79
        for session in [75_000.0, 69_000.0] {
            clock.advance(1_000);
            estimator.update(None, &reading(session, 50.0));
        }

        let measured = (79_000.0 - 25_000.0) / (0.79 - 0.2);
        let expected = 0.5 * measured + 0.5 * CAPACITY;
        let status = estimator.status();
        assert!(!status.recalibration_active);
        assert!((status.capacity_estimate - expected).abs() < 1.0);
        assert!((status.state_of_health - expected / CAPACITY).abs() < 1e-4);
    }

    #[test]
    fn implausible_capacity_is_discarded() {
        let clock = TestClock::at(0);
        let mut estimator = ChargeEstimator::new(MidRange, config(), &clock);
        estimator.initialise(ChargeEstimatorSeed {
            recalibration_active: true,
            recalibration_start_charge: 75_000.0,
            ..seed(0.9)
        });
        estimator.update(None, &reading(0.0, 0.0));
        // drops below high with only 4 kAs moved since the start
        clock.advance(1_000);
        estimator.update(None, &reading(-11_000.0, 0.0));
        let status = estimator.status();
        assert!(!status.recalibration_active);
        assert_eq!(status.capacity_estimate, CAPACITY);
    }

    #[test]
    fn sensor_fault_freezes_estimate() {
        let clock = TestClock::at(0);
        let mut estimator = ChargeEstimator::new(MidRange, config(), &clock);
        estimator.initialise(seed(0.5));
        estimator.update(None, &reading(0.0, 0.0));

        clock.advance(1_000);
        let faulted = ShuntReading {
            fault: true,
            ..reading(20_000.0, 0.0)
        };
        estimator.update(None, &faulted);
        assert_eq!(estimator.state(), EstimatorState::Fault);
        assert_close(estimator.soc_corrected(), 0.5);

        // stays frozen after the sensor recovers
        clock.advance(1_000);
        estimator.update(None, &reading(20_000.0, 0.0));
        assert_eq!(estimator.state(), EstimatorState::Fault);
        assert_close(estimator.soc_corrected(), 0.5);
    }

    #[test]
    fn seed_reproduces_corrected_soc() {
        let clock = TestClock::at(0);
        let mut estimator = ChargeEstimator::new(CELL_OCV_TABLE, config(), &clock);
        estimator.initialise(seed(0.5));
        let cells = CellSummary {
            cell_voltage_min: 4.0,
            cell_voltage_max: 4.10,
            average_temperature: 25.0,
        };
        estimator.update(Some(&cells), &reading(0.0, 0.0));
        for _ in 0..20 {
            clock.advance(1_000);
            estimator.update(Some(&cells), &reading(1_000.0, 0.0));
        }
        let before = estimator.status();
        assert!(before.charge_offset > 0.0);

        let mut restarted = ChargeEstimator::new(CELL_OCV_TABLE, config(), &clock);
        restarted.initialise(estimator.seed());
        assert_close(restarted.soc_corrected(), before.soc_corrected);
        assert_eq!(restarted.capacity_estimate(), before.capacity_estimate);
    }
}
