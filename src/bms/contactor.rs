//! Single contactor driver
//!
//! Drives one electromechanical switch through a digital output and checks
//! the auxiliary feedback contact. Commanded transitions go through a
//! `Closing`/`Opening` state where feedback is ignored for the debounce time
//! and must reach the expected level before the timeout.
//!
//! # States
//! ```text
//! Init -> Open <-> Closing -> Closed <-> Opening -> Open
//!            \________ any unexpected feedback / timeout ________> Fault
//! ```
//! `Fault` keeps the output off until [`Contactor::initialise`] runs again.

use core::fmt;

use bitflags::bitflags;
use embedded_hal::digital::{InputPin, OutputPin, PinState};

use crate::clock::{elapsed_ms, Clock, Millis};
use crate::settings::{CONTACTOR_DEBOUNCE_MS, CONTACTOR_TIMEOUT_MS};

/// Contactor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ContactorState {
    /// Constructed, feedback not checked yet
    Init,
    /// Output off, feedback confirms open
    Open,
    /// Output on, waiting for feedback to confirm closed
    Closing,
    /// Output on, feedback confirms closed
    Closed,
    /// Output off, waiting for feedback to confirm open
    Opening,
    /// Output forced off after a feedback anomaly
    Fault,
}

impl ContactorState {
    /// Short upper-case name for status output
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Opening => "OPENING",
            Self::Fault => "FAULT",
        }
    }
}

bitflags! {
    /// Latched contactor faults
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContactorDtc: u8 {
        /// Feedback read closed during initialisation
        const INIT_CLOSED_UNEXPECTED = 1 << 0;
        /// Feedback went closed while the contactor was open
        const UNEXPECTED_CLOSED = 1 << 1;
        /// Feedback went open while the contactor was closed
        const UNEXPECTED_OPEN = 1 << 2;
        /// Feedback never confirmed an open command
        const OPEN_TIMEOUT = 1 << 3;
        /// Feedback never confirmed a close command
        const CLOSE_TIMEOUT = 1 << 4;
    }
}

impl fmt::Display for ContactorDtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        super::write_flag_names(f, self.iter_names())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ContactorDtc {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ContactorDtc({=u8:#x})", self.bits())
    }
}

/// Debounce and timeout for one contactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ContactorTiming {
    /// Feedback is not evaluated until this long after a command
    pub debounce_ms: u32,
    /// Feedback must confirm a command within this time
    pub timeout_ms: u32,
}

impl Default for ContactorTiming {
    fn default() -> Self {
        Self {
            debounce_ms: CONTACTOR_DEBOUNCE_MS,
            timeout_ms: CONTACTOR_TIMEOUT_MS,
        }
    }
}

/// One contactor: output drive, feedback input and its supervision state
pub struct Contactor<O, I, C> {
    name: &'static str,
    output: O,
    feedback: I,
    clock: C,
    closed_level: PinState,
    timing: ContactorTiming,
    allow_external_control: bool,
    feedback_disabled: bool,
    output_command: bool,
    feedback_raw: bool,
    state: ContactorState,
    dtc: ContactorDtc,
    last_state_change: Millis,
}

impl<O, I, C> Contactor<O, I, C>
where
    O: OutputPin,
    I: InputPin,
    C: Clock,
{
    /// Creates a contactor in `Init` with its output driven off.
    ///
    /// `closed_level` is the feedback input level that means "contacts closed".
    pub fn new(
        name: &'static str,
        output: O,
        feedback: I,
        closed_level: PinState,
        timing: ContactorTiming,
        clock: C,
    ) -> Self {
        let last_state_change = clock.now_ms();
        let mut contactor = Self {
            name,
            output,
            feedback,
            clock,
            closed_level,
            timing,
            allow_external_control: false,
            feedback_disabled: false,
            output_command: false,
            feedback_raw: false,
            state: ContactorState::Init,
            dtc: ContactorDtc::empty(),
            last_state_change,
        };
        contactor.drive(false);
        contactor
    }

    /// Accept feedback changes nobody commanded as an external open/close
    /// instead of treating them as faults
    pub fn with_external_control(mut self, allow: bool) -> Self {
        self.allow_external_control = allow;
        self
    }

    /// Picks a safe starting state from the current feedback.
    ///
    /// Also used to recover from `Fault`: the DTC is cleared and the
    /// feedback is checked again.
    pub fn initialise(&mut self) {
        self.dtc = ContactorDtc::empty();
        self.drive(false);

        if self.feedback_disabled {
            self.transition(ContactorState::Open);
            return;
        }

        if self.sample_feedback() {
            if self.allow_external_control {
                self.transition(ContactorState::Closed);
            } else {
                self.raise(ContactorDtc::INIT_CLOSED_UNEXPECTED);
            }
        } else {
            self.transition(ContactorState::Open);
        }
    }

    /// Commands the contactor closed. Ignored unless `Open` or `Opening`.
    pub fn close(&mut self) {
        if matches!(self.state, ContactorState::Open | ContactorState::Opening) {
            self.transition(ContactorState::Closing);
            self.drive(true);
        }
    }

    /// Commands the contactor open. Ignored unless `Closed` or `Closing`.
    pub fn open(&mut self) {
        if matches!(self.state, ContactorState::Closed | ContactorState::Closing) {
            self.transition(ContactorState::Opening);
            self.drive(false);
        }
    }

    /// Periodic supervision, called once per contactor tick
    pub fn update(&mut self) {
        match self.state {
            ContactorState::Init => {}
            ContactorState::Open => {
                if !self.feedback_disabled && self.sample_feedback() {
                    if self.allow_external_control {
                        info!("{}: closed externally", self.name);
                        self.transition(ContactorState::Closed);
                    } else {
                        self.raise(ContactorDtc::UNEXPECTED_CLOSED);
                    }
                }
            }
            ContactorState::Closed => {
                if !self.feedback_disabled && !self.sample_feedback() {
                    if self.allow_external_control {
                        info!("{}: opened externally", self.name);
                        self.transition(ContactorState::Open);
                    } else {
                        self.raise(ContactorDtc::UNEXPECTED_OPEN);
                    }
                }
            }
            ContactorState::Closing => self.supervise_transition(true),
            ContactorState::Opening => self.supervise_transition(false),
            ContactorState::Fault => self.drive(false),
        }
    }

    /// Enables or disables the feedback bypass used for maintenance.
    ///
    /// Entering the bypass adopts the commanded output as the state. Leaving
    /// it re-runs [`Contactor::initialise`].
    pub fn set_feedback_disabled(&mut self, disabled: bool) {
        if disabled == self.feedback_disabled {
            return;
        }
        self.feedback_disabled = disabled;

        if disabled {
            warn!("{}: feedback bypass enabled", self.name);
            self.dtc = ContactorDtc::empty();
            let state = if self.output_command {
                ContactorState::Closed
            } else {
                ContactorState::Open
            };
            self.transition(state);
        } else {
            info!("{}: feedback bypass disabled", self.name);
            self.initialise();
        }
    }

    pub fn state(&self) -> ContactorState {
        self.state
    }

    pub fn dtc(&self) -> ContactorDtc {
        self.dtc
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Feedback as last sampled, `true` when the contacts read closed
    pub fn feedback_closed(&self) -> bool {
        self.feedback_raw
    }

    /// Whether the output currently commands the contactor closed
    pub fn output_commanded(&self) -> bool {
        self.output_command
    }

    pub fn feedback_disabled(&self) -> bool {
        self.feedback_disabled
    }

    fn supervise_transition(&mut self, closing: bool) {
        let elapsed = elapsed_ms(self.clock.now_ms(), self.last_state_change);

        if !self.feedback_disabled && elapsed > self.timing.timeout_ms {
            let dtc = if closing {
                ContactorDtc::CLOSE_TIMEOUT
            } else {
                ContactorDtc::OPEN_TIMEOUT
            };
            self.raise(dtc);
            return;
        }

        if elapsed > self.timing.debounce_ms {
            let confirmed = self.feedback_disabled || self.sample_feedback() == closing;
            if confirmed {
                let settled = if closing {
                    ContactorState::Closed
                } else {
                    ContactorState::Open
                };
                self.transition(settled);
            }
        }
    }

    fn sample_feedback(&mut self) -> bool {
        let reading = match self.closed_level {
            PinState::High => self.feedback.is_high(),
            PinState::Low => self.feedback.is_low(),
        };
        // an unreadable input counts as open
        self.feedback_raw = reading.unwrap_or(false);
        self.feedback_raw
    }

    fn drive(&mut self, closed: bool) {
        self.output_command = closed;
        // embassy-rp pins are infallible
        let _ = self.output.set_state(PinState::from(closed));
    }

    fn transition(&mut self, state: ContactorState) {
        if self.state != state {
            debug!("{}: {} -> {}", self.name, self.state.as_str(), state.as_str());
        }
        self.state = state;
        self.last_state_change = self.clock.now_ms();
    }

    fn raise(&mut self, dtc: ContactorDtc) {
        self.dtc |= dtc;
        self.drive(false);
        if self.state != ContactorState::Fault {
            error!("{}: fault {} in {}", self.name, dtc, self.state.as_str());
            self.transition(ContactorState::Fault);
        }
    }
}
