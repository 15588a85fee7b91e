//! Charge estimation task
//!
//! Runs the coulomb counting estimator once per `CHARGE_TIMELOOP_MS` on the
//! latest current sensor reading and cell summary, publishes the status and
//! writes the estimator seed to flash every `CHARGE_SAVE_INTERVAL_S`.

use defmt::info;
use embassy_time::{Duration, Ticker};
use ev_bms::bms::coulomb_counting::{ChargeEstimator, EstimatorConfig, EstimatorState};
use ev_bms::bms::soc_lookup::CELL_OCV_TABLE;
use ev_bms::settings::{CHARGE_SAVE_INTERVAL_S, CHARGE_TIMELOOP_MS};

use crate::system::{clock::SystemClock, state::SYSTEM_STATE};
use crate::task::flash_storage::{FlashCommand, load_charge_seed, send_flash_command};

/// Estimator ticks between two seed saves
const TICKS_PER_SAVE: u32 = CHARGE_SAVE_INTERVAL_S * 1000 / CHARGE_TIMELOOP_MS;

#[embassy_executor::task]
pub async fn charge_estimate() {
    let mut estimator = ChargeEstimator::new(&CELL_OCV_TABLE, EstimatorConfig::default(), SystemClock);
    estimator.initialise(load_charge_seed().await);
    info!("Charge estimation started");

    let mut ticks_since_save = 0;
    let mut ticker = Ticker::every(Duration::from_millis(u64::from(CHARGE_TIMELOOP_MS)));
    loop {
        ticker.next().await;

        let (cells, shunt) = {
            let state = SYSTEM_STATE.lock().await;
            (state.cells, state.shunt.map(|shunt| shunt.reading).unwrap_or_default())
        };
        estimator.update(cells.as_ref(), &shunt);
        SYSTEM_STATE.lock().await.charge = Some(estimator.status());

        ticks_since_save += 1;
        if ticks_since_save >= TICKS_PER_SAVE && estimator.state() != EstimatorState::Init {
            ticks_since_save = 0;
            send_flash_command(FlashCommand::SaveChargeSeed(estimator.seed())).await;
        }
    }
}
