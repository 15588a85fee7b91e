//! Operator console
//!
//! Single-letter line commands received over the UART and the text renderings
//! of the status snapshots. Parsing and formatting are kept free of I/O; the
//! console task owns the transport.
//!
//! | Line      | Action                                   |
//! |-----------|------------------------------------------|
//! | `c`       | close contactors                         |
//! | `o`       | open contactors                          |
//! | `s`       | contactor status                         |
//! | `q`       | charge estimator status                  |
//! | `i`       | current sensor status                    |
//! | `r`       | clear a latched current sensor fault     |
//! | `b0`/`b1` | feedback bypass off/on                   |
//! | `t0`/`t1` | timed delay / voltage match precharge    |
//! | `v<V>`    | voltage match tolerance                  |
//! | `m<ms>`   | voltage match timeout                    |
//! | `w`       | write contactor settings to flash        |
//! | `x`       | erase stored settings and charge seed    |
//! | `h`, `?`  | help                                     |

use core::fmt::{self, Write};

use crate::bms::contactor_manager::{ContactorSnapshot, ContactorStatus};
use crate::bms::coulomb_counting::ChargeStatus;
use crate::bms::current::{ShuntDtc, ShuntReading, ShuntState};
use crate::bms::precharge::{StrategyKind, VoltageSample};

pub const HELP: &str = "\
Available commands:
  c      - close contactors
  o      - open contactors
  s      - show contactor status
  q      - show charge estimator status
  i      - show current sensor status
  r      - reset current sensor fault
  b0|b1  - contactor feedback bypass off/on
  t0|t1  - precharge strategy timed delay/voltage match
  vX.X   - set voltage match tolerance (V)
  mX     - set voltage match timeout (ms)
  w      - write contactor settings to flash
  x      - erase stored settings and charge seed
  h|?    - print this help message
";

/// A parsed console line
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Close,
    Open,
    ContactorStatus,
    ChargeStatus,
    ShuntStatus,
    ResetShunt,
    FeedbackBypass(bool),
    Strategy(StrategyKind),
    Tolerance(f32),
    Timeout(u32),
    Save,
    Erase,
    Help,
}

/// Why a console line was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Blank line
    Empty,
    /// First letter is not a command
    Unknown(char),
    /// Command needs an argument
    MissingArgument(char),
    /// Argument could not be parsed
    InvalidArgument(char),
    /// Command takes no argument
    UnexpectedArgument(char),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty command"),
            Self::Unknown(c) => write!(f, "unknown command '{c}', h for help"),
            Self::MissingArgument(c) => write!(f, "'{c}' needs an argument"),
            Self::InvalidArgument(c) => write!(f, "invalid argument for '{c}'"),
            Self::UnexpectedArgument(c) => write!(f, "'{c}' takes no argument"),
        }
    }
}

impl Command {
    /// Parses one line, ignoring surrounding whitespace
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        let mut chars = line.chars();
        let letter = chars.next().ok_or(CommandError::Empty)?;
        let argument = chars.as_str().trim();

        let bare = |command: Command| {
            if argument.is_empty() {
                Ok(command)
            } else {
                Err(CommandError::UnexpectedArgument(letter))
            }
        };
        let required = || {
            if argument.is_empty() {
                Err(CommandError::MissingArgument(letter))
            } else {
                Ok(argument)
            }
        };
        let flag = || match required()? {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(CommandError::InvalidArgument(letter)),
        };

        match letter {
            'c' => bare(Command::Close),
            'o' => bare(Command::Open),
            's' => bare(Command::ContactorStatus),
            'q' => bare(Command::ChargeStatus),
            'i' => bare(Command::ShuntStatus),
            'r' => bare(Command::ResetShunt),
            'w' => bare(Command::Save),
            'x' => bare(Command::Erase),
            'h' | '?' => bare(Command::Help),
            'b' => flag().map(Command::FeedbackBypass),
            't' => flag().map(|voltage_match| {
                Command::Strategy(if voltage_match {
                    StrategyKind::VoltageMatch
                } else {
                    StrategyKind::TimedDelay
                })
            }),
            'v' => required()?
                .parse::<f32>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Command::Tolerance)
                .ok_or(CommandError::InvalidArgument(letter)),
            'm' => required()?
                .parse::<u32>()
                .map(Command::Timeout)
                .map_err(|_| CommandError::InvalidArgument(letter)),
            other => Err(CommandError::Unknown(other)),
        }
    }
}

/// Renders the contactor snapshot
pub fn write_contactor_status<W: Write>(out: &mut W, status: &ContactorStatus) -> fmt::Result {
    writeln!(
        out,
        "Contactors: {} (target {}), DTC: {}",
        status.state.as_str(),
        status.target.as_str(),
        status.dtc
    )?;
    writeln!(
        out,
        "  Strategy: {}, tolerance {:.1}V, timeout {}ms, feedback bypass {}",
        status.settings.strategy.as_str(),
        status.settings.voltage_match_tolerance,
        status.settings.voltage_match_timeout_ms,
        on_off(status.feedback_disabled)
    )?;
    write_contactor(out, "Precharge", &status.precharge)?;
    write_contactor(out, "Positive", &status.positive)?;
    writeln!(
        out,
        "  Negative: {}, supply: {}",
        if status.negative_closed { "CLOSED" } else { "OPEN" },
        if status.supply_available { "OK" } else { "MISSING" }
    )?;
    write!(out, "  HV bus: ")?;
    write_voltage(out, status.hv_bus_voltage)?;
    write!(out, ", pack: ")?;
    write_voltage(out, status.pack_voltage)?;
    writeln!(out)
}

/// Renders the charge estimator snapshot
pub fn write_charge_status<W: Write>(out: &mut W, status: &ChargeStatus) -> fmt::Result {
    writeln!(
        out,
        "Charge: {}, SOC {:.1}% (coulomb {:.1}%), SOH {:.1}%",
        status.state.as_str(),
        status.soc_corrected * 100.0,
        status.soc_coulomb * 100.0,
        status.state_of_health * 100.0
    )?;
    writeln!(
        out,
        "  Capacity {:.1}Ah, total {:.1}Ah, session {:.1}Ah, offset {:.1}Ah",
        status.capacity_estimate / 3600.0,
        status.total_charge / 3600.0,
        status.session_accumulated_charge / 3600.0,
        status.charge_offset / 3600.0
    )?;
    writeln!(
        out,
        "  Rest {:.0}s, recalibration {} (start {:.1}Ah)",
        status.rest_timer_s,
        on_off(status.recalibration_active),
        status.recalibration_start_charge / 3600.0
    )
}

/// Renders the current sensor signals
pub fn write_shunt_status<W: Write>(
    out: &mut W,
    state: ShuntState,
    dtc: ShuntDtc,
    reading: &ShuntReading,
) -> fmt::Result {
    writeln!(out, "Current sensor: {}, DTC: {}", state.as_str(), dtc)?;
    writeln!(
        out,
        "  Current {:.2}A (avg {:.2}A, {:.1}A/s), integrated {:.1}As",
        reading.current,
        reading.current_average,
        reading.current_derivative,
        reading.accumulated_charge
    )
}

fn write_contactor<W: Write>(out: &mut W, name: &str, contactor: &ContactorSnapshot) -> fmt::Result {
    writeln!(
        out,
        "  {}: {}, output {}, feedback {}, DTC: {}",
        name,
        contactor.state.as_str(),
        on_off(contactor.output_commanded),
        if contactor.feedback_closed { "CLOSED" } else { "OPEN" },
        contactor.dtc
    )
}

fn write_voltage<W: Write>(out: &mut W, sample: Option<VoltageSample>) -> fmt::Result {
    match sample {
        Some(sample) => write!(out, "{:.1}V", sample.volts),
        None => out.write_str("--"),
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
