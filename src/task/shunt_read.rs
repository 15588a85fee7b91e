//! Pack current measurement
//!
//! Samples a Hall effect current sensor through the shared ADC and feeds the
//! result into the `Shunt` integrator.
//!
//! # Current Calculation
//! ```text
//! Sensor Voltage = (ADC Value * 3.3V * 2.0) / 4096
//! Current        = (Sensor Voltage - 2.5V) / 0.004 V/A
//! Where:
//! - 2.0 is the divider scaling the 5V sensor output into the ADC range
//! - 2.5V is the sensor output at zero current
//! - 4mV/A gives +-500A over the sensor's +-2V swing
//! ```
//! The sensor is mounted so that charging current reads positive.
//!
//! A failed conversion skips the sample; if that keeps happening the
//! integrator's timeout raises the fault. Faults latch until the console
//! raises `SHUNT_RESET`.

use defmt::{info, warn};
use embassy_rp::{adc::Channel, gpio::Pull};
use embassy_time::{Duration, Ticker};
use ev_bms::bms::current::Shunt;

use crate::system::{
    clock::SystemClock,
    event::SHUNT_RESET,
    resources::{CurrentSensorResources, get_adc},
    state::{SYSTEM_STATE, ShuntSnapshot},
};

/// Time between current samples, well inside the shunt timeout
const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// ADC reference voltage
const REF_VOLTAGE: f32 = 3.3;

/// Divider between sensor output and ADC pin
const V_DIVIDER_RATIO: f32 = 2.0;

/// ADC resolution (12-bit = 4096 steps)
const ADC_RANGE: f32 = 4096.0;

/// Sensor output at zero current (V)
const SENSOR_ZERO_V: f32 = 2.5;

/// Sensor sensitivity (V/A)
const SENSOR_SENSITIVITY: f32 = 0.004;

#[embassy_executor::task]
pub async fn shunt_read(r: CurrentSensorResources) {
    let mut channel = Channel::new_pin(r.sense_pin, Pull::None);
    let mut shunt = Shunt::new(SystemClock);
    info!("Current sensor task started");

    let mut ticker = Ticker::every(SAMPLE_INTERVAL);
    loop {
        if SHUNT_RESET.try_take().is_some() {
            info!("Current sensor reset, dtc was {}", shunt.dtc());
            shunt.reset();
        }

        let raw = {
            let mut adc_guard = get_adc().lock().await;
            match adc_guard.as_mut() {
                Some(adc) => adc.read(&mut channel).await.ok(),
                None => None,
            }
        };

        match raw {
            Some(raw) => shunt.on_sample(raw_to_current(raw)),
            None => warn!("Current sensor conversion failed"),
        }
        shunt.update();

        SYSTEM_STATE.lock().await.shunt = Some(ShuntSnapshot {
            state: shunt.state(),
            dtc: shunt.dtc(),
            reading: shunt.reading(),
        });

        ticker.next().await;
    }
}

fn raw_to_current(raw: u16) -> f32 {
    let volts = f32::from(raw) * REF_VOLTAGE * V_DIVIDER_RATIO / ADC_RANGE;
    (volts - SENSOR_ZERO_V) / SENSOR_SENSITIVITY
}
