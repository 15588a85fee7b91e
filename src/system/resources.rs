//! Hardware Resource Management
//!
//! Assigns the RP2350 pins and peripherals to the tasks that own them.
//!
//! # Resource Groups
//! - Contactors: precharge and positive coil drivers with their auxiliary
//!   feedback contacts, negative contactor feedback and coil supply sense
//! - Current sensor: Hall sensor output on an ADC pin
//! - HV monitor: pack and HV bus voltage dividers on ADC pins, die temperature
//! - Console: UART0 with two DMA channels
//! - Flash storage: on-board flash with one DMA channel
//!
//! # Shared Resources
//! The ADC is shared between the current sensor and the HV monitor and is
//! protected by a mutex. Tasks acquire the lock for a single conversion and
//! release it right after.

use assign_resources::assign_resources;
use embassy_rp::adc::InterruptHandler as AdcInterruptHandler;
use embassy_rp::adc::{Adc, Async as AdcAsync};
use embassy_rp::bind_interrupts;
use embassy_rp::peripherals::{self, ADC, UART0};
use embassy_rp::uart::InterruptHandler as UartInterruptHandler;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

/// Global ADC instance protected by a mutex.
static ADC: Mutex<CriticalSectionRawMutex, Option<Adc<'static, AdcAsync>>> = Mutex::new(None);

/// Initializes the ADC peripheral.
///
/// This should only be called once during system initialization in main.rs,
/// before any tasks are spawned.
pub fn init_adc(adc: ADC) {
    let adc = Adc::new(adc, Irqs, embassy_rp::adc::Config::default());
    critical_section::with(|_| {
        if let Ok(mut slot) = ADC.try_lock() {
            *slot = Some(adc);
        }
    });
}

/// Returns a reference to the protected ADC instance.
pub fn get_adc() -> &'static Mutex<CriticalSectionRawMutex, Option<Adc<'static, AdcAsync>>> {
    &ADC
}

assign_resources! {
    /// Contactor coil drivers and feedback inputs
    contactors: ContactorResources {
        precharge_out: PIN_10,
        precharge_feedback: PIN_11,
        positive_out: PIN_12,
        positive_feedback: PIN_13,
        negative_feedback: PIN_14,
        supply_sense: PIN_15,
    },
    /// Hall effect current sensor output
    current_sensor: CurrentSensorResources {
        sense_pin: PIN_26,
    },
    /// Pack and HV bus voltage dividers
    hv_monitor: HvMonitorResources {
        pack_pin: PIN_27,
        hv_bus_pin: PIN_28,
        temp_sensor: ADC_TEMP_SENSOR,
    },
    /// Operator console
    console: ConsoleResources {
        uart: UART0,
        tx_pin: PIN_0,
        rx_pin: PIN_1,
        tx_dma: DMA_CH0,
        rx_dma: DMA_CH1,
    },
    /// Settings and estimator seed storage
    flash: FlashResources {
        flash: FLASH,
        dma: DMA_CH2,
    },
}

bind_interrupts!(pub struct Irqs {
    ADC_IRQ_FIFO => AdcInterruptHandler;
    UART0_IRQ => UartInterruptHandler<UART0>;
});
