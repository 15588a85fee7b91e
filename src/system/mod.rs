//! Core system components for the BMS firmware
pub mod clock;
pub mod event;
pub mod resources;
pub mod state;
