//! System State Management
//!
//! Latest snapshots published by the control tasks. Each task owns its state
//! machine and copies a value snapshot in here after every tick; the console
//! and the charge estimator only ever read.
//!
//! # State Access Pattern
//! ```rust
//! let state = SYSTEM_STATE.lock().await;
//! // Read or modify state here
//! // Lock automatically released when state goes out of scope
//! ```

use defmt::Format;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use ev_bms::bms::{
    contactor_manager::ContactorStatus,
    coulomb_counting::{CellSummary, ChargeStatus},
    current::{ShuntDtc, ShuntReading, ShuntState},
};

/// Global system state protected by a mutex
///
/// Everything starts as `None` until the owning task has run once.
pub static SYSTEM_STATE: Mutex<CriticalSectionRawMutex, SystemState> = Mutex::new(SystemState {
    contactors: None,
    charge: None,
    shunt: None,
    cells: None,
});

/// Current sensor snapshot
#[derive(Debug, Clone, Copy, Format)]
pub struct ShuntSnapshot {
    pub state: ShuntState,
    pub dtc: ShuntDtc,
    pub reading: ShuntReading,
}

#[derive(Format)]
pub struct SystemState {
    /// Published by `contactor_control` every 20 ms
    pub contactors: Option<ContactorStatus>,
    /// Published by `charge_estimate` every second
    pub charge: Option<ChargeStatus>,
    /// Published by `shunt_read` after every sample
    pub shunt: Option<ShuntSnapshot>,
    /// Published by `hv_monitor`; `None` while the pack voltage is implausible
    pub cells: Option<CellSummary>,
}
