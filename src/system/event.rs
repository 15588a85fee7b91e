//! System Events
//!
//! Channels between the firmware tasks. The contactor task is the only
//! consumer of both channels and drains them once per control tick.
//! The current sensor task polls its reset signal the same way.

use defmt::Format;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use ev_bms::settings::ContactorSettings;

/// Operator requests for the contactor manager
pub static CONTACTOR_COMMANDS: Channel<CriticalSectionRawMutex, ContactorCommand, 4> = Channel::new();

/// Voltage samples from the HV monitor
pub static VOLTAGE_FEED: Channel<CriticalSectionRawMutex, VoltageReading, 8> = Channel::new();

/// Operator request to clear a latched current sensor fault
pub static SHUNT_RESET: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Requests accepted by the contactor task
#[derive(Debug, Clone, Copy, Format)]
pub enum ContactorCommand {
    /// Sequence precharge and positive closed
    Close,
    /// Open positive then precharge
    Open,
    /// Ignore (true) or honour (false) contactor feedback
    FeedbackBypass(bool),
    /// Replace the runtime tuning; already validated by the sender
    ApplySettings(ContactorSettings),
}

/// Measurements pushed into the contactor manager
#[derive(Debug, Clone, Copy, Format)]
pub enum VoltageReading {
    /// Pack voltage (V) and whether the measurement is plausible
    Pack { volts: f32, valid: bool },
    /// HV bus voltage (V), `None` when the sense line is implausible
    HvBus(Option<f32>),
}

/// Sends an operator request to the contactor task
pub async fn send_command(command: ContactorCommand) {
    CONTACTOR_COMMANDS.sender().send(command).await;
}

/// Sends a voltage sample to the contactor task
pub async fn send_voltage(reading: VoltageReading) {
    VOLTAGE_FEED.sender().send(reading).await;
}
