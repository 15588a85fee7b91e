//! Battery management for an EV conversion pack
//!
//! Hardware-free core of the `ev-bms` firmware: contactor sequencing, current
//! integration and state of charge estimation, plus the settings, flash record
//! encoding and console parsing around them. Everything here is driven by
//! periodic `update()` calls and reads time through [`clock::Clock`], so it
//! runs unchanged on the RP2350 and in host tests.
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod bms;
pub mod clock;
pub mod console;
pub mod persistence;
pub mod settings;
