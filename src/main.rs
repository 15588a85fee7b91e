//! BMS firmware entry point
//!
//! Initializes the system and spawns the control tasks.

#![no_std]
#![no_main]

use crate::task::{
    charge_estimate::charge_estimate, console::console, contactor_control::contactor_control,
    flash_storage::flash_storage, hv_monitor::hv_monitor, shunt_read::shunt_read,
};
use embassy_executor::Spawner;
use embassy_rp::block::ImageDef;
use embassy_rp::config::Config;
use system::resources::{
    self, AssignedResources, ConsoleResources, ContactorResources, CurrentSensorResources, FlashResources,
    HvMonitorResources,
};
use {defmt_rtt as _, panic_probe as _};

/// Firmware image type for bootloader
#[link_section = ".start_block"]
#[used]
pub static IMAGE_DEF: ImageDef = ImageDef::secure_exe();

/// System core modules
mod system;
/// Task implementations
mod task;

/// Firmware entry point
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Config::default());

    // The ADC is shared by the current sensor and the HV monitor and must be
    // ready before either task runs.
    resources::init_adc(p.ADC);

    let r = split_resources!(p);

    // Flash first: the contactor and charge tasks block on their stored settings
    spawner.spawn(flash_storage(r.flash)).unwrap();
    spawner.spawn(contactor_control(r.contactors)).unwrap();
    spawner.spawn(shunt_read(r.current_sensor)).unwrap();
    spawner.spawn(hv_monitor(r.hv_monitor)).unwrap();
    spawner.spawn(charge_estimate()).unwrap();
    spawner.spawn(console(r.console)).unwrap();
}
