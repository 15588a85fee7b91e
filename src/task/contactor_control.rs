//! Contactor control task
//!
//! Owns the contactor manager and ticks it every `CONTACTOR_TIMELOOP_MS`.
//! Before each tick it drains the voltage feed and the operator command
//! queue, afterwards it publishes a status snapshot to the system state.
//!
//! # Wiring
//! - Coil drivers are active high and start de-energised
//! - Auxiliary contacts pull their input low when closed (internal pull-up)
//! - Coil supply sense is high when the supply is present (internal pull-down)

use defmt::{info, warn};
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_time::{Duration, Ticker};
use embedded_hal::digital::PinState;
use ev_bms::bms::contactor::{Contactor, ContactorTiming};
use ev_bms::bms::contactor_manager::{ContactorManager, ManagerConfig};
use ev_bms::settings::CONTACTOR_TIMELOOP_MS;

use crate::system::clock::SystemClock;
use crate::system::event::{CONTACTOR_COMMANDS, ContactorCommand, VOLTAGE_FEED, VoltageReading};
use crate::system::resources::ContactorResources;
use crate::system::state::SYSTEM_STATE;
use crate::task::flash_storage::load_contactor_settings;

type Manager = ContactorManager<Output<'static>, Input<'static>, SystemClock>;

#[embassy_executor::task]
pub async fn contactor_control(r: ContactorResources) {
    let clock = SystemClock;
    let timing = ContactorTiming::default();

    // Outputs are driven off before anything else can happen
    let precharge = Contactor::new(
        "Precharge",
        Output::new(r.precharge_out, Level::Low),
        Input::new(r.precharge_feedback, Pull::Up),
        PinState::Low,
        timing,
        clock,
    );
    let positive = Contactor::new(
        "Positive",
        Output::new(r.positive_out, Level::Low),
        Input::new(r.positive_feedback, Pull::Up),
        PinState::Low,
        timing,
        clock,
    );

    let settings = load_contactor_settings().await;
    let mut manager: Manager = ContactorManager::new(
        precharge,
        positive,
        Input::new(r.negative_feedback, Pull::Up),
        Input::new(r.supply_sense, Pull::Down),
        ManagerConfig::default(),
        settings,
        clock,
    );
    manager.initialise();
    info!("Contactor control started in {}", manager.state().as_str());

    let mut ticker = Ticker::every(Duration::from_millis(u64::from(CONTACTOR_TIMELOOP_MS)));
    loop {
        while let Ok(reading) = VOLTAGE_FEED.try_receive() {
            apply_voltage(&mut manager, reading);
        }
        while let Ok(command) = CONTACTOR_COMMANDS.try_receive() {
            apply_command(&mut manager, command);
        }

        manager.update();
        SYSTEM_STATE.lock().await.contactors = Some(manager.status());

        ticker.next().await;
    }
}

fn apply_voltage(manager: &mut Manager, reading: VoltageReading) {
    match reading {
        VoltageReading::Pack { volts, valid } => manager.set_pack_voltage(volts, valid),
        VoltageReading::HvBus(Some(volts)) => manager.set_hv_bus_voltage(volts),
        VoltageReading::HvBus(None) => manager.invalidate_hv_bus_voltage(),
    }
}

fn apply_command(manager: &mut Manager, command: ContactorCommand) {
    info!("Contactor command: {}", command);
    match command {
        ContactorCommand::Close => manager.close(),
        ContactorCommand::Open => manager.open(),
        ContactorCommand::FeedbackBypass(disabled) => {
            if let Err(e) = manager.set_feedback_disabled(disabled) {
                warn!("Feedback bypass change refused: {}", e);
            }
        }
        ContactorCommand::ApplySettings(settings) => manager.apply_settings(settings),
    }
}
