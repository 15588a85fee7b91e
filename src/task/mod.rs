//! Firmware tasks, one per concern
pub mod charge_estimate;
pub mod console;
pub mod contactor_control;
pub mod flash_storage;
pub mod hv_monitor;
pub mod shunt_read;
