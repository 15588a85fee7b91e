//! High voltage monitoring
//!
//! Measures the pack voltage and the HV bus voltage behind the contactors
//! through resistor dividers on the shared ADC, filters both with a moving
//! median and pushes them to the contactor task. Without cell monitoring
//! boards the cell summary for the charge estimator is derived from the pack
//! voltage and the die temperature.
//!
//! # Voltage Calculations
//! ```text
//! HV Voltage = (ADC Value * 3.3V * 150.0) / 4096
//! ```
//! 150:1 dividers give a 495V full scale on both channels.

use defmt::{info, warn};
use embassy_rp::{adc::Channel, gpio::Pull};
use embassy_time::{Duration, Ticker, Timer};
use ev_bms::bms::coulomb_counting::CellSummary;
use ev_bms::settings::{CELLS_IN_SERIES, PACK_VOLTAGE_MAX_PLAUSIBLE_V, PACK_VOLTAGE_MIN_PLAUSIBLE_V};
use moving_median::MovingMedian;

use crate::system::{
    event::{self, VoltageReading},
    resources::{HvMonitorResources, get_adc},
    state::SYSTEM_STATE,
};

/// Time between measurements
const MEASUREMENT_INTERVAL: Duration = Duration::from_millis(50);

/// ADC reference voltage
const REF_VOLTAGE: f32 = 3.3;

/// HV divider ratio (pack and bus)
const V_DIVIDER_RATIO: f32 = 150.0;

/// ADC resolution (12-bit = 4096 steps)
const ADC_RANGE: f32 = 4096.0;

/// Bus readings above this mean a broken divider (V)
const HV_BUS_MAX_PLAUSIBLE_V: f32 = 480.0;

/// Median filter window
const MEDIAN_WINDOW_SIZE: usize = 9;

/// Die temperature sensor: 0.706V at 27°C, -1.721mV/°C
const TEMP_SENSOR_V_AT_27C: f32 = 0.706;
const TEMP_SENSOR_SLOPE: f32 = 0.001721;

#[embassy_executor::task]
pub async fn hv_monitor(r: HvMonitorResources) {
    let mut pack_channel = Channel::new_pin(r.pack_pin, Pull::None);
    let mut bus_channel = Channel::new_pin(r.hv_bus_pin, Pull::None);
    let mut temp_channel = Channel::new_temp_sensor(r.temp_sensor);

    let mut pack_filter = MovingMedian::<f32, MEDIAN_WINDOW_SIZE>::new();
    let mut bus_filter = MovingMedian::<f32, MEDIAN_WINDOW_SIZE>::new();

    // Let the dividers settle before the first reading
    Timer::after(Duration::from_millis(100)).await;
    info!("HV monitor started");

    let mut ticker = Ticker::every(MEASUREMENT_INTERVAL);
    loop {
        let (pack_raw, bus_raw, temp_raw) = {
            let mut adc_guard = get_adc().lock().await;
            match adc_guard.as_mut() {
                Some(adc) => (
                    adc.read(&mut pack_channel).await.ok(),
                    adc.read(&mut bus_channel).await.ok(),
                    adc.read(&mut temp_channel).await.ok(),
                ),
                None => (None, None, None),
            }
        };

        let pack = pack_raw.map(|raw| {
            pack_filter.add_value(raw_to_hv(raw));
            pack_filter.median()
        });
        let pack_valid =
            pack.is_some_and(|v| (PACK_VOLTAGE_MIN_PLAUSIBLE_V..=PACK_VOLTAGE_MAX_PLAUSIBLE_V).contains(&v));
        if pack.is_none() {
            warn!("Pack voltage conversion failed");
        }
        event::send_voltage(VoltageReading::Pack {
            volts: pack.unwrap_or(0.0),
            valid: pack_valid,
        })
        .await;

        let bus = bus_raw
            .map(|raw| {
                bus_filter.add_value(raw_to_hv(raw));
                bus_filter.median()
            })
            .filter(|v| *v <= HV_BUS_MAX_PLAUSIBLE_V);
        event::send_voltage(VoltageReading::HvBus(bus)).await;

        let cells = match (pack, temp_raw) {
            (Some(volts), Some(temp_raw)) if pack_valid => {
                let cell_voltage = volts / CELLS_IN_SERIES as f32;
                Some(CellSummary {
                    cell_voltage_min: cell_voltage,
                    cell_voltage_max: cell_voltage,
                    average_temperature: raw_to_die_temperature(temp_raw),
                })
            }
            _ => None,
        };
        SYSTEM_STATE.lock().await.cells = cells;

        ticker.next().await;
    }
}

fn raw_to_hv(raw: u16) -> f32 {
    f32::from(raw) * REF_VOLTAGE * V_DIVIDER_RATIO / ADC_RANGE
}

fn raw_to_die_temperature(raw: u16) -> f32 {
    let volts = f32::from(raw) * REF_VOLTAGE / ADC_RANGE;
    27.0 - (volts - TEMP_SENSOR_V_AT_27C) / TEMP_SENSOR_SLOPE
}
