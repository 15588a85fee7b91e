//! Contactor sequencing
//!
//! Owns the precharge and positive contactors and watches the externally
//! wired negative contactor and the contactor supply. Closing always runs
//! precharge first and only closes the positive contactor once the active
//! [`Strategy`] says the HV bus is charged. Opening drops the positive
//! contactor first and holds precharge for the precharge time.
//!
//! # States
//! ```text
//! Open -> ClosingPrecharge -> ClosingPositive -> Closed
//!   ^          |                    |              |
//!   |          v                    v              v
//!   +---- OpeningPrecharge <---- OpeningPositive <-+
//! ```
//! Any contactor fault, a missing negative contactor or a missing supply sends
//! the manager to `Fault`, which holds both contactors open until the manager
//! is re-initialised.

use core::fmt;

use bitflags::bitflags;
use embedded_hal::digital::{InputPin, OutputPin, PinState};

use crate::bms::contactor::{Contactor, ContactorDtc, ContactorState};
use crate::bms::precharge::{
    PrechargeContext, PrechargeStrategy, PrechargeVerdict, Strategy, VoltageSample,
};
use crate::clock::{elapsed_ms, Clock, Millis};
use crate::settings::{
    ContactorSettings, CONTACTOR_PRCHG_TIME_MS, HV_BUS_MISSING_TIMEOUT_MS,
    HV_BUS_VOLTAGE_VALIDITY_MS, PACK_VOLTAGE_MISSING_TIMEOUT_MS, PACK_VOLTAGE_VALIDITY_MS,
};

/// Manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ManagerState {
    Init,
    Open,
    ClosingPrecharge,
    ClosingPositive,
    Closed,
    OpeningPositive,
    OpeningPrecharge,
    Fault,
}

impl ManagerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Open => "OPEN",
            Self::ClosingPrecharge => "CLOSING_PRECHARGE",
            Self::ClosingPositive => "CLOSING_POSITIVE",
            Self::Closed => "CLOSED",
            Self::OpeningPositive => "OPENING_POSITIVE",
            Self::OpeningPrecharge => "OPENING_PRECHARGE",
            Self::Fault => "FAULT",
        }
    }

    /// States that are taking the contactors towards open
    pub fn is_opening(self) -> bool {
        matches!(self, Self::OpeningPositive | Self::OpeningPrecharge)
    }
}

/// Requested end state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TargetState {
    Open,
    Closed,
}

impl TargetState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }
}

bitflags! {
    /// Latched manager faults
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ManagerDtc: u8 {
        /// Contactor supply input reads absent
        const NO_SUPPLY = 1 << 0;
        /// Negative contactor feedback reads open
        const NEGATIVE_FAULT = 1 << 1;
        /// Precharge contactor reported a fault
        const PRECHARGE_FAULT = 1 << 2;
        /// Positive contactor reported a fault
        const POSITIVE_FAULT = 1 << 3;
        /// HV bus never reached the pack voltage
        const VOLTAGE_MATCH_TIMEOUT = 1 << 4;
        /// No usable HV bus voltage during precharge
        const EXTERNAL_HV_MISSING = 1 << 5;
        /// No usable pack voltage during precharge
        const PACK_VOLTAGE_MISSING = 1 << 6;
    }
}

impl fmt::Display for ManagerDtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        super::write_flag_names(f, self.iter_names())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ManagerDtc {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ManagerDtc({=u8:#x})", self.bits())
    }
}

/// Rejected feedback bypass change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BypassError {
    /// Leaving the bypass re-checks each contactor from scratch, which is
    /// only safe with both coils de-energised
    ContactorsEnergised,
}

impl fmt::Display for BypassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContactorsEnergised => f.write_str("contactors energised, open them first"),
        }
    }
}

/// Sequencing delays and voltage sample windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ManagerTiming {
    /// Timed precharge duration, also the precharge hold time when opening
    pub precharge_time_ms: u32,
    pub hv_bus_validity_ms: u32,
    pub pack_validity_ms: u32,
    pub hv_bus_missing_timeout_ms: u32,
    pub pack_missing_timeout_ms: u32,
}

impl Default for ManagerTiming {
    fn default() -> Self {
        Self {
            precharge_time_ms: CONTACTOR_PRCHG_TIME_MS,
            hv_bus_validity_ms: HV_BUS_VOLTAGE_VALIDITY_MS,
            pack_validity_ms: PACK_VOLTAGE_VALIDITY_MS,
            hv_bus_missing_timeout_ms: HV_BUS_MISSING_TIMEOUT_MS,
            pack_missing_timeout_ms: PACK_VOLTAGE_MISSING_TIMEOUT_MS,
        }
    }
}

/// Fixed manager wiring and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub timing: ManagerTiming,
    /// Negative feedback input level meaning "negative contactor closed"
    pub negative_closed_level: PinState,
    /// Supply sense input level meaning "contactor supply available"
    pub supply_present_level: PinState,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timing: ManagerTiming::default(),
            negative_closed_level: PinState::Low,
            supply_present_level: PinState::High,
        }
    }
}

/// Value snapshot of one contactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContactorSnapshot {
    pub state: ContactorState,
    pub dtc: ContactorDtc,
    pub output_commanded: bool,
    pub feedback_closed: bool,
}

impl ContactorSnapshot {
    fn of<O, I, C>(contactor: &Contactor<O, I, C>) -> Self
    where
        O: OutputPin,
        I: InputPin,
        C: Clock,
    {
        Self {
            state: contactor.state(),
            dtc: contactor.dtc(),
            output_commanded: contactor.output_commanded(),
            feedback_closed: contactor.feedback_closed(),
        }
    }
}

/// Value snapshot of the whole contactor system, published for the console
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContactorStatus {
    pub state: ManagerState,
    pub target: TargetState,
    pub dtc: ManagerDtc,
    pub settings: ContactorSettings,
    pub precharge: ContactorSnapshot,
    pub positive: ContactorSnapshot,
    pub negative_closed: bool,
    pub supply_available: bool,
    pub hv_bus_voltage: Option<VoltageSample>,
    pub pack_voltage: Option<VoltageSample>,
    pub feedback_disabled: bool,
}

/// Precharge/positive contactor sequencer
pub struct ContactorManager<O, I, C> {
    precharge: Contactor<O, I, C>,
    positive: Contactor<O, I, C>,
    negative_feedback: I,
    supply_sense: I,
    clock: C,
    config: ManagerConfig,
    settings: ContactorSettings,
    strategy: Strategy,
    negative_contactor_closed: bool,
    contactor_supply_available: bool,
    state: ManagerState,
    target: TargetState,
    hv_bus_voltage: Option<VoltageSample>,
    pack_voltage: Option<VoltageSample>,
    last_precharge_change: Millis,
    feedback_disabled: bool,
    dtc: ManagerDtc,
}

impl<O, I, C> ContactorManager<O, I, C>
where
    O: OutputPin,
    I: InputPin,
    C: Clock,
{
    /// Creates the manager in `Init`; nothing is sequenced until
    /// [`ContactorManager::initialise`] runs.
    pub fn new(
        precharge: Contactor<O, I, C>,
        positive: Contactor<O, I, C>,
        negative_feedback: I,
        supply_sense: I,
        config: ManagerConfig,
        settings: ContactorSettings,
        clock: C,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            precharge,
            positive,
            negative_feedback,
            supply_sense,
            clock,
            strategy: Strategy::from_settings(&settings, &config.timing),
            config,
            settings,
            negative_contactor_closed: false,
            contactor_supply_available: false,
            state: ManagerState::Init,
            target: TargetState::Open,
            hv_bus_voltage: None,
            pack_voltage: None,
            last_precharge_change: now,
            feedback_disabled: false,
            dtc: ManagerDtc::empty(),
        }
    }

    /// Initialises both contactors, clears the manager DTC and picks the
    /// starting state from the contactor outputs.
    pub fn initialise(&mut self) {
        self.precharge.initialise();
        self.positive.initialise();
        self.dtc = ManagerDtc::empty();
        self.sample_inputs();
        self.reconstruct_state();
        info!(
            "contactor manager initialised: {} using {}",
            self.state.as_str(),
            self.strategy.kind().as_str()
        );
    }

    /// Periodic sequencing, called once per contactor tick
    pub fn update(&mut self) {
        if self.state == ManagerState::Init {
            return;
        }

        self.sample_inputs();
        self.positive.update();
        self.precharge.update();

        let faults = self.detect_faults();
        if !faults.is_empty() {
            self.enter_fault_state(faults);
            return;
        }

        let now = self.clock.now_ms();
        match self.state {
            ManagerState::Init => {}
            ManagerState::Open => {
                if self.target == TargetState::Closed {
                    self.precharge.close();
                    self.transition(ManagerState::ClosingPrecharge);
                }
            }
            ManagerState::ClosingPrecharge => match self.target {
                TargetState::Closed => {
                    if self.precharge.state() == ContactorState::Closed {
                        self.last_precharge_change = now;
                        self.transition(ManagerState::ClosingPositive);
                    }
                }
                TargetState::Open => {
                    self.precharge.open();
                    self.last_precharge_change = now;
                    self.transition(ManagerState::OpeningPrecharge);
                }
            },
            ManagerState::ClosingPositive => match self.target {
                TargetState::Closed => {
                    if matches!(self.positive.state(), ContactorState::Open | ContactorState::Opening) {
                        let ctx = PrechargeContext {
                            now,
                            elapsed_ms: elapsed_ms(now, self.last_precharge_change),
                            hv_bus: self.hv_bus_voltage,
                            pack: self.pack_voltage,
                        };
                        match self.strategy.poll(&ctx) {
                            PrechargeVerdict::Wait => {}
                            PrechargeVerdict::ClosePositive => {
                                info!("precharge complete after {}ms, closing positive", ctx.elapsed_ms);
                                self.positive.close();
                            }
                            PrechargeVerdict::Fault(dtc) => {
                                self.enter_fault_state(dtc);
                                return;
                            }
                        }
                    }
                    if self.positive.state() == ContactorState::Closed {
                        self.transition(ManagerState::Closed);
                    }
                }
                TargetState::Open => {
                    self.positive.open();
                    self.transition(ManagerState::OpeningPositive);
                }
            },
            ManagerState::Closed => {
                if self.target == TargetState::Open {
                    self.positive.open();
                    self.transition(ManagerState::OpeningPositive);
                }
            }
            // opening runs to completion whatever the target says
            ManagerState::OpeningPositive => {
                if self.positive.state() == ContactorState::Open {
                    self.last_precharge_change = now;
                    self.transition(ManagerState::OpeningPrecharge);
                }
            }
            ManagerState::OpeningPrecharge => {
                if elapsed_ms(now, self.last_precharge_change) > self.config.timing.precharge_time_ms {
                    self.precharge.open();
                }
                if self.precharge.state() == ContactorState::Open {
                    self.transition(ManagerState::Open);
                }
            }
            ManagerState::Fault => self.force_open(),
        }
    }

    /// Requests the closed end state
    pub fn close(&mut self) {
        if self.target != TargetState::Closed {
            info!("contactors: close requested in {}", self.state.as_str());
        }
        self.target = TargetState::Closed;
    }

    /// Requests the open end state
    pub fn open(&mut self) {
        if self.target != TargetState::Open {
            info!("contactors: open requested in {}", self.state.as_str());
        }
        self.target = TargetState::Open;
    }

    /// Switches the feedback bypass on both contactors, clears the manager
    /// DTC and rebuilds the state from what the contactors are doing.
    ///
    /// Leaving the bypass is refused while either output is energised.
    pub fn set_feedback_disabled(&mut self, disabled: bool) -> Result<(), BypassError> {
        if self.feedback_disabled
            && !disabled
            && (self.precharge.output_commanded() || self.positive.output_commanded())
        {
            warn!("contactor feedback bypass kept on in {}", self.state.as_str());
            return Err(BypassError::ContactorsEnergised);
        }

        self.feedback_disabled = disabled;
        self.precharge.set_feedback_disabled(disabled);
        self.positive.set_feedback_disabled(disabled);
        self.dtc = ManagerDtc::empty();
        self.sample_inputs();
        self.reconstruct_state();
        warn!(
            "contactor feedback bypass {}, now {}",
            if disabled { "on" } else { "off" },
            self.state.as_str()
        );
        Ok(())
    }

    /// Pushes a fresh HV bus voltage (V)
    pub fn set_hv_bus_voltage(&mut self, volts: f32) {
        self.hv_bus_voltage = Some(VoltageSample {
            volts,
            timestamp: self.clock.now_ms(),
        });
    }

    /// Pushes a fresh pack voltage (V); an invalid reading clears the sample
    pub fn set_pack_voltage(&mut self, volts: f32, valid: bool) {
        self.pack_voltage = valid.then(|| VoltageSample {
            volts,
            timestamp: self.clock.now_ms(),
        });
    }

    pub fn invalidate_hv_bus_voltage(&mut self) {
        self.hv_bus_voltage = None;
    }

    /// Replaces the runtime tuning and rebuilds the strategy
    pub fn apply_settings(&mut self, settings: ContactorSettings) {
        self.settings = settings;
        self.strategy = Strategy::from_settings(&settings, &self.config.timing);
        info!(
            "precharge strategy {} tolerance {}V timeout {}ms",
            settings.strategy.as_str(),
            settings.voltage_match_tolerance,
            settings.voltage_match_timeout_ms
        );
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn target(&self) -> TargetState {
        self.target
    }

    pub fn dtc(&self) -> ManagerDtc {
        self.dtc
    }

    pub fn settings(&self) -> ContactorSettings {
        self.settings
    }

    pub fn precharge(&self) -> &Contactor<O, I, C> {
        &self.precharge
    }

    pub fn positive(&self) -> &Contactor<O, I, C> {
        &self.positive
    }

    pub fn negative_contactor_closed(&self) -> bool {
        self.negative_contactor_closed
    }

    pub fn contactor_supply_available(&self) -> bool {
        self.contactor_supply_available
    }

    pub fn feedback_disabled(&self) -> bool {
        self.feedback_disabled
    }

    pub fn status(&self) -> ContactorStatus {
        ContactorStatus {
            state: self.state,
            target: self.target,
            dtc: self.dtc,
            settings: self.settings,
            precharge: ContactorSnapshot::of(&self.precharge),
            positive: ContactorSnapshot::of(&self.positive),
            negative_closed: self.negative_contactor_closed,
            supply_available: self.contactor_supply_available,
            hv_bus_voltage: self.hv_bus_voltage,
            pack_voltage: self.pack_voltage,
            feedback_disabled: self.feedback_disabled,
        }
    }

    fn sample_inputs(&mut self) {
        self.negative_contactor_closed =
            read_level(&mut self.negative_feedback, self.config.negative_closed_level);
        self.contactor_supply_available =
            read_level(&mut self.supply_sense, self.config.supply_present_level);
    }

    fn contactor_faults(&self) -> ManagerDtc {
        let mut faults = ManagerDtc::empty();
        if self.precharge.state() == ContactorState::Fault {
            faults |= ManagerDtc::PRECHARGE_FAULT;
        }
        if self.positive.state() == ContactorState::Fault {
            faults |= ManagerDtc::POSITIVE_FAULT;
        }
        faults
    }

    fn detect_faults(&self) -> ManagerDtc {
        let mut faults = self.contactor_faults();
        // negative and supply inputs are not checked in bypass
        if !self.feedback_disabled {
            if !self.negative_contactor_closed {
                faults |= ManagerDtc::NEGATIVE_FAULT;
            }
            if !self.contactor_supply_available {
                faults |= ManagerDtc::NO_SUPPLY;
            }
        }
        faults
    }

    fn enter_fault_state(&mut self, dtc: ManagerDtc) {
        let new = dtc - self.dtc;
        self.dtc |= dtc;
        self.force_open();
        if self.state != ManagerState::Fault {
            error!("contactor manager fault {} in {}", dtc, self.state.as_str());
            self.transition(ManagerState::Fault);
        } else if !new.is_empty() {
            warn!("contactor manager additional fault {}", new);
        }
    }

    fn force_open(&mut self) {
        self.positive.open();
        self.precharge.open();
    }

    fn reconstruct_state(&mut self) {
        let faults = self.contactor_faults();
        if !faults.is_empty() {
            self.target = TargetState::Open;
            self.enter_fault_state(faults);
            return;
        }

        // an opening sequence runs to completion
        if self.state.is_opening() {
            self.target = TargetState::Open;
            return;
        }

        let (state, target) = match (self.precharge.output_commanded(), self.positive.output_commanded()) {
            (_, true) => (ManagerState::Closed, TargetState::Closed),
            (true, false) => {
                self.last_precharge_change = self.clock.now_ms();
                (ManagerState::ClosingPositive, TargetState::Closed)
            }
            (false, false) => (ManagerState::Open, TargetState::Open),
        };
        // a pending open request is never turned back into a close
        if self.target == TargetState::Closed {
            self.target = target;
        }
        self.transition(state);
    }

    fn transition(&mut self, state: ManagerState) {
        if self.state != state {
            debug!("contactors: {} -> {}", self.state.as_str(), state.as_str());
        }
        self.state = state;
    }
}

fn read_level<I: InputPin>(pin: &mut I, level: PinState) -> bool {
    let reading = match level {
        PinState::High => pin.is_high(),
        PinState::Low => pin.is_low(),
    };
    reading.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bms::contactor::ContactorTiming;
    use crate::bms::precharge::StrategyKind;
    use crate::bms::testing::{FakeInput, FakeOutput};
    use crate::clock::testing::TestClock;

    type Manager = ContactorManager<FakeOutput, FakeInput, TestClock>;

    /// Manager wired to pin doubles. With `follow` set the contactor
    /// feedback tracks the outputs like healthy hardware.
    struct Rig {
        clock: TestClock,
        precharge_out: FakeOutput,
        precharge_fb: FakeInput,
        positive_out: FakeOutput,
        positive_fb: FakeInput,
        negative: FakeInput,
        supply: FakeInput,
        follow: bool,
        manager: Manager,
    }

    impl Rig {
        fn new(settings: ContactorSettings) -> Self {
            let clock = TestClock::at(1_000);
            let precharge_out = FakeOutput::default();
            let precharge_fb = FakeInput::high();
            let positive_out = FakeOutput::default();
            let positive_fb = FakeInput::high();
            // negative closed (active low), supply present (active high)
            let negative = FakeInput::default();
            let supply = FakeInput::high();

            let timing = ContactorTiming {
                debounce_ms: 100,
                timeout_ms: 200,
            };
            let precharge = Contactor::new(
                "precharge",
                precharge_out.clone(),
                precharge_fb.clone(),
                PinState::Low,
                timing,
                clock.clone(),
            );
            let positive = Contactor::new(
                "positive",
                positive_out.clone(),
                positive_fb.clone(),
                PinState::Low,
                timing,
                clock.clone(),
            );
            let mut manager = ContactorManager::new(
                precharge,
                positive,
                negative.clone(),
                supply.clone(),
                ManagerConfig::default(),
                settings,
                clock.clone(),
            );
            manager.initialise();

            Self {
                clock,
                precharge_out,
                precharge_fb,
                positive_out,
                positive_fb,
                negative,
                supply,
                follow: true,
                manager,
            }
        }

        fn timed() -> Self {
            Self::new(ContactorSettings::default())
        }

        fn voltage_match() -> Self {
            Self::new(ContactorSettings::default().with_strategy(StrategyKind::VoltageMatch))
        }

        fn mirror(&self) {
            self.precharge_fb.drive(!self.precharge_out.is_set_high());
            self.positive_fb.drive(!self.positive_out.is_set_high());
        }

        fn tick(&mut self, ms: u32) {
            self.clock.advance(ms);
            if self.follow {
                self.mirror();
            }
            self.manager.update();
        }

        /// Ticks at the contactor period until `state`, giving up after `max_ms`
        fn run_until(&mut self, state: ManagerState, max_ms: u32) -> bool {
            let mut waited = 0;
            while self.manager.state() != state {
                if waited >= max_ms {
                    return false;
                }
                self.tick(20);
                waited += 20;
            }
            true
        }
    }

    #[test]
    fn initialise_starts_open() {
        let rig = Rig::timed();
        assert_eq!(rig.manager.state(), ManagerState::Open);
        assert_eq!(rig.manager.target(), TargetState::Open);
        assert!(rig.manager.dtc().is_empty());
        assert!(rig.manager.negative_contactor_closed());
        assert!(rig.manager.contactor_supply_available());
    }

    #[test]
    fn update_before_initialise_does_nothing() {
        let clock = TestClock::at(0);
        let contactor = |out: &FakeOutput| {
            Contactor::new(
                "c",
                out.clone(),
                FakeInput::high(),
                PinState::Low,
                ContactorTiming::default(),
                clock.clone(),
            )
        };
        let out = FakeOutput::default();
        let mut manager = ContactorManager::new(
            contactor(&out),
            contactor(&out),
            FakeInput::high(),
            FakeInput::default(),
            ManagerConfig::default(),
            ContactorSettings::default(),
            clock.clone(),
        );
        manager.close();
        manager.update();
        assert_eq!(manager.state(), ManagerState::Init);
        assert!(manager.dtc().is_empty());
    }

    #[test]
    fn timed_delay_closes_positive_just_after_precharge_time() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::ClosingPositive, 1_000));
        assert_eq!(rig.manager.precharge().state(), ContactorState::Closed);
        let stamp = rig.clock.now_ms();

        while rig.clock.now_ms() - stamp < 2_000 {
            rig.tick(20);
            assert!(!rig.positive_out.is_set_high());
        }
        assert_eq!(rig.clock.now_ms() - stamp, 2_000);

        rig.tick(1);
        assert!(rig.positive_out.is_set_high());
        assert!(rig.run_until(ManagerState::Closed, 500));
        assert!(rig.manager.dtc().is_empty());
    }

    #[test]
    fn positive_never_closes_before_precharge_is_confirmed() {
        let mut rig = Rig::timed();
        rig.manager.close();
        for _ in 0..200 {
            rig.tick(20);
            if rig.positive_out.is_set_high() {
                assert_eq!(rig.manager.precharge().state(), ContactorState::Closed);
            }
        }
        assert_eq!(rig.manager.state(), ManagerState::Closed);
    }

    #[test]
    fn opening_drops_positive_then_holds_precharge() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::Closed, 5_000));

        rig.manager.open();
        rig.tick(20);
        assert_eq!(rig.manager.state(), ManagerState::OpeningPositive);
        assert!(!rig.positive_out.is_set_high());
        assert!(rig.precharge_out.is_set_high());

        assert!(rig.run_until(ManagerState::OpeningPrecharge, 500));
        let stamp = rig.clock.now_ms();
        while rig.clock.now_ms() - stamp < 2_000 {
            rig.tick(20);
            assert!(rig.precharge_out.is_set_high());
        }
        rig.tick(20);
        assert!(!rig.precharge_out.is_set_high());
        assert!(rig.run_until(ManagerState::Open, 500));
    }

    #[test]
    fn close_request_does_not_redirect_opening() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::Closed, 5_000));

        rig.manager.open();
        rig.tick(20);
        rig.manager.close();
        let mut seen = Vec::new();
        for _ in 0..200 {
            rig.tick(20);
            let state = rig.manager.state();
            if seen.last() != Some(&state) {
                seen.push(state);
            }
            if state == ManagerState::Open {
                break;
            }
        }
        assert_eq!(
            seen,
            [
                ManagerState::OpeningPositive,
                ManagerState::OpeningPrecharge,
                ManagerState::Open,
            ]
        );

        // the standing close request starts a new cycle from Open
        rig.tick(20);
        assert_eq!(rig.manager.state(), ManagerState::ClosingPrecharge);
    }

    #[test]
    fn open_request_during_precharge_backs_out() {
        let mut rig = Rig::timed();
        rig.manager.close();
        rig.tick(20);
        assert_eq!(rig.manager.state(), ManagerState::ClosingPrecharge);

        rig.manager.open();
        rig.tick(20);
        assert_eq!(rig.manager.state(), ManagerState::OpeningPrecharge);
        assert!(rig.run_until(ManagerState::Open, 3_000));
        assert!(!rig.positive_out.is_set_high());
        assert!(!rig.precharge_out.is_set_high());
    }

    #[test]
    fn voltage_match_closes_once_bus_reaches_pack() {
        let mut rig = Rig::voltage_match();
        rig.manager.close();
        let mut bus = 0.0;
        for _ in 0..200 {
            rig.manager.set_pack_voltage(360.0, true);
            rig.manager.set_hv_bus_voltage(bus);
            rig.tick(20);
            bus = (bus + 8.0_f32).min(358.0);
        }
        assert_eq!(rig.manager.state(), ManagerState::Closed);
        assert!(rig.manager.dtc().is_empty());
    }

    #[test]
    fn voltage_match_times_out_and_opens_everything() {
        let mut rig = Rig::voltage_match();
        rig.manager.close();
        for _ in 0..400 {
            rig.manager.set_pack_voltage(360.0, true);
            rig.manager.set_hv_bus_voltage(200.0);
            rig.tick(20);
            if rig.manager.state() == ManagerState::Fault {
                break;
            }
        }
        assert_eq!(rig.manager.state(), ManagerState::Fault);
        assert_eq!(rig.manager.dtc(), ManagerDtc::VOLTAGE_MATCH_TIMEOUT);

        for _ in 0..20 {
            rig.tick(20);
        }
        assert_eq!(rig.manager.precharge().state(), ContactorState::Open);
        assert_eq!(rig.manager.positive().state(), ContactorState::Open);
        assert!(!rig.precharge_out.is_set_high());
        assert!(!rig.positive_out.is_set_high());
    }

    #[test]
    fn voltage_match_without_bus_sample_faults() {
        let mut rig = Rig::voltage_match();
        rig.manager.close();
        for _ in 0..400 {
            rig.manager.set_pack_voltage(360.0, true);
            rig.tick(20);
        }
        assert_eq!(rig.manager.state(), ManagerState::Fault);
        assert_eq!(rig.manager.dtc(), ManagerDtc::EXTERNAL_HV_MISSING);
    }

    #[test]
    fn invalidated_bus_sample_is_not_used() {
        let mut rig = Rig::voltage_match();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::ClosingPositive, 1_000));
        rig.manager.set_pack_voltage(360.0, true);
        rig.manager.set_hv_bus_voltage(359.0);
        rig.manager.invalidate_hv_bus_voltage();
        rig.tick(20);
        assert!(!rig.positive_out.is_set_high());
    }

    #[test]
    fn lost_negative_contactor_faults() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::ClosingPositive, 1_000));

        rig.negative.drive(true);
        rig.tick(20);
        assert_eq!(rig.manager.state(), ManagerState::Fault);
        assert_eq!(rig.manager.dtc(), ManagerDtc::NEGATIVE_FAULT);
        assert!(!rig.precharge_out.is_set_high());
    }

    #[test]
    fn lost_supply_faults() {
        let mut rig = Rig::timed();
        rig.supply.drive(false);
        rig.tick(20);
        assert_eq!(rig.manager.state(), ManagerState::Fault);
        assert_eq!(rig.manager.dtc(), ManagerDtc::NO_SUPPLY);
    }

    #[test]
    fn contactor_fault_propagates_and_latches() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::ClosingPositive, 1_000));

        // precharge feedback drops out while closed
        rig.follow = false;
        rig.precharge_fb.drive(true);
        rig.tick(20);
        assert_eq!(rig.manager.state(), ManagerState::Fault);
        assert!(rig.manager.dtc().contains(ManagerDtc::PRECHARGE_FAULT));
        assert_eq!(
            rig.manager.precharge().dtc(),
            ContactorDtc::UNEXPECTED_OPEN
        );

        // healthy signals and a close request do not leave Fault
        rig.follow = true;
        rig.manager.close();
        for _ in 0..100 {
            rig.tick(20);
        }
        assert_eq!(rig.manager.state(), ManagerState::Fault);
        assert!(!rig.positive_out.is_set_high());
        assert!(!rig.precharge_out.is_set_high());
    }

    #[test]
    fn manager_fault_recovers_through_bypass_toggle() {
        let mut rig = Rig::timed();
        rig.supply.drive(false);
        rig.tick(20);
        assert_eq!(rig.manager.state(), ManagerState::Fault);

        rig.supply.drive(true);
        assert_eq!(rig.manager.set_feedback_disabled(true), Ok(()));
        assert_eq!(rig.manager.set_feedback_disabled(false), Ok(()));
        assert_eq!(rig.manager.state(), ManagerState::Open);
        assert!(rig.manager.dtc().is_empty());
    }

    #[test]
    fn bypass_mid_precharge_keeps_sequence() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::ClosingPositive, 1_000));

        assert_eq!(rig.manager.set_feedback_disabled(true), Ok(()));
        assert_eq!(rig.manager.state(), ManagerState::ClosingPositive);
        assert_eq!(rig.manager.target(), TargetState::Closed);

        // feedback and negative/supply inputs are ignored while bypassed
        rig.follow = false;
        rig.precharge_fb.drive(true);
        rig.negative.drive(true);
        assert!(rig.run_until(ManagerState::Closed, 3_000));
        assert!(rig.manager.dtc().is_empty());
        assert!(rig.manager.status().feedback_disabled);
    }

    #[test]
    fn bypass_while_opening_keeps_opening() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::Closed, 5_000));
        rig.manager.open();
        assert!(rig.run_until(ManagerState::OpeningPrecharge, 1_000));

        assert_eq!(rig.manager.set_feedback_disabled(true), Ok(()));
        assert_eq!(rig.manager.state(), ManagerState::OpeningPrecharge);
        assert_eq!(rig.manager.target(), TargetState::Open);

        for _ in 0..200 {
            rig.tick(20);
            assert!(!rig.positive_out.is_set_high());
        }
        assert_eq!(rig.manager.state(), ManagerState::Open);
        assert!(!rig.precharge_out.is_set_high());
    }

    #[test]
    fn bypass_keeps_pending_open_request() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::ClosingPositive, 1_000));

        rig.manager.open();
        assert_eq!(rig.manager.set_feedback_disabled(true), Ok(()));
        assert_eq!(rig.manager.target(), TargetState::Open);

        assert!(rig.run_until(ManagerState::Open, 5_000));
        assert!(!rig.positive_out.is_set_high());
        assert!(!rig.precharge_out.is_set_high());
    }

    #[test]
    fn leaving_bypass_needs_contactors_open() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::Closed, 5_000));
        assert_eq!(rig.manager.set_feedback_disabled(true), Ok(()));
        rig.tick(20);

        assert_eq!(rig.manager.set_feedback_disabled(false), Err(BypassError::ContactorsEnergised));
        assert!(rig.manager.feedback_disabled());
        assert_eq!(rig.manager.state(), ManagerState::Closed);
        assert!(rig.manager.dtc().is_empty());
        assert!(rig.positive_out.is_set_high());
        assert!(rig.precharge_out.is_set_high());

        rig.manager.open();
        assert!(rig.run_until(ManagerState::Open, 5_000));
        assert_eq!(rig.manager.set_feedback_disabled(false), Ok(()));
        assert!(!rig.manager.feedback_disabled());
        assert_eq!(rig.manager.state(), ManagerState::Open);
        assert!(rig.manager.dtc().is_empty());
        assert_eq!(rig.manager.precharge().state(), ContactorState::Open);
        assert_eq!(rig.manager.positive().state(), ContactorState::Open);
    }

    #[test]
    fn bypass_with_positive_closed_reconstructs_closed() {
        let mut rig = Rig::timed();
        rig.manager.close();
        assert!(rig.run_until(ManagerState::Closed, 5_000));
        assert_eq!(rig.manager.set_feedback_disabled(true), Ok(()));
        assert_eq!(rig.manager.state(), ManagerState::Closed);
        assert_eq!(rig.manager.target(), TargetState::Closed);
    }

    #[test]
    fn settings_switch_strategy() {
        let mut rig = Rig::timed();
        let settings = ContactorSettings::default()
            .with_strategy(StrategyKind::VoltageMatch)
            .with_tolerance(5.0)
            .unwrap();
        rig.manager.apply_settings(settings);
        assert_eq!(rig.manager.settings(), settings);
        assert_eq!(rig.manager.status().settings.strategy, StrategyKind::VoltageMatch);
    }

    #[test]
    fn status_snapshot_reflects_contactors() {
        let mut rig = Rig::timed();
        rig.manager.set_pack_voltage(355.0, true);
        rig.manager.set_pack_voltage(0.0, false);
        rig.manager.set_hv_bus_voltage(12.0);
        rig.manager.close();
        rig.tick(20);
        let status = rig.manager.status();
        assert_eq!(status.state, ManagerState::ClosingPrecharge);
        assert_eq!(status.target, TargetState::Closed);
        assert!(status.precharge.output_commanded);
        assert_eq!(status.precharge.state, ContactorState::Closing);
        assert!(!status.positive.output_commanded);
        assert_eq!(status.pack_voltage, None);
        assert_eq!(status.hv_bus_voltage.map(|s| s.volts), Some(12.0));
    }

    #[test]
    fn dtc_names_render() {
        let dtc = ManagerDtc::NO_SUPPLY | ManagerDtc::PACK_VOLTAGE_MISSING;
        assert_eq!(dtc.to_string(), "NO_SUPPLY, PACK_VOLTAGE_MISSING");
    }
}
