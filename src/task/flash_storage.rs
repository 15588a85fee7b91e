//! Flash storage task for persistent BMS data
//!
//! Keeps the contactor tuning and the charge estimator seed in the last two
//! sectors of flash using the `sequential-storage` map. Record layouts live
//! in `ev_bms::persistence`; this task only moves them between flash and the
//! other tasks.
//!
//! Loads always answer: a missing or unreadable record is replaced by the
//! default value so the requesting task never waits forever.

use defmt::*;
use embassy_rp::flash::{Async, ERASE_SIZE, Flash};
use embassy_rp::peripherals::FLASH;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel, signal::Signal};
use embassy_time::{Duration, Timer};
use embedded_storage_async::nor_flash::NorFlash;
use ev_bms::bms::coulomb_counting::ChargeEstimatorSeed;
use ev_bms::persistence::StorageKey;
use ev_bms::settings::ContactorSettings;
use sequential_storage::{
    cache::NoCache,
    map::{Value, fetch_item, store_item},
};

use crate::system::resources::FlashResources;

/// Size of the on-board flash
const FLASH_SIZE: usize = 2048 * 1024;

/// Size of one flash sector (4KB on RP2350)
const FLASH_SECTOR_SIZE: usize = ERASE_SIZE;

/// Number of sectors to use for storage (2 sectors for wear leveling)
const STORAGE_SECTOR_COUNT: usize = 2;

/// Total storage size
const STORAGE_SIZE: usize = FLASH_SECTOR_SIZE * STORAGE_SECTOR_COUNT;

/// Flash storage offset from the end of flash (last 8KB = 2 sectors)
const STORAGE_OFFSET: u32 = (FLASH_SIZE - STORAGE_SIZE) as u32;

/// Size of the command queue
const COMMAND_QUEUE_SIZE: usize = 4;

type StorageFlash = Flash<'static, FLASH, Async, FLASH_SIZE>;

/// Channel for sending flash storage commands
static FLASH_COMMAND_CHANNEL: Channel<CriticalSectionRawMutex, FlashCommand, COMMAND_QUEUE_SIZE> = Channel::new();

/// Signal for returning the contactor settings
static CONTACTOR_SETTINGS_SIGNAL: Signal<CriticalSectionRawMutex, ContactorSettings> = Signal::new();

/// Signal for returning the charge estimator seed
static CHARGE_SEED_SIGNAL: Signal<CriticalSectionRawMutex, ChargeEstimatorSeed> = Signal::new();

/// Send a flash storage command
pub async fn send_flash_command(command: FlashCommand) {
    FLASH_COMMAND_CHANNEL.send(command).await;
}

/// Receive a flash storage command
async fn receive_flash_command() -> FlashCommand {
    FLASH_COMMAND_CHANNEL.receive().await
}

/// Stored record selector
#[derive(Debug, Clone, Copy, Format, PartialEq, Eq)]
pub enum RecordKind {
    ContactorSettings,
    ChargeSeed,
}

/// Commands that can be sent to the flash storage task
#[derive(Debug, Clone, Copy, Format)]
pub enum FlashCommand {
    /// Read a record (responds via signal)
    Load(RecordKind),
    /// Write the contactor tuning
    SaveContactorSettings(ContactorSettings),
    /// Write the charge estimator seed
    SaveChargeSeed(ChargeEstimatorSeed),
    /// Erase every stored record
    EraseAll,
}

/// Loads the contactor settings, falling back to defaults
///
/// # Example
/// ```rust
/// let settings = load_contactor_settings().await;
/// ```
pub async fn load_contactor_settings() -> ContactorSettings {
    CONTACTOR_SETTINGS_SIGNAL.reset();
    send_flash_command(FlashCommand::Load(RecordKind::ContactorSettings)).await;
    CONTACTOR_SETTINGS_SIGNAL.wait().await
}

/// Loads the charge estimator seed, falling back to defaults
pub async fn load_charge_seed() -> ChargeEstimatorSeed {
    CHARGE_SEED_SIGNAL.reset();
    send_flash_command(FlashCommand::Load(RecordKind::ChargeSeed)).await;
    CHARGE_SEED_SIGNAL.wait().await
}

/// Flash storage task
///
/// Handles all flash read/write operations. It responds to commands sent via
/// the command channel and uses sequential-storage for wear leveling and data
/// integrity.
#[embassy_executor::task]
pub async fn flash_storage(r: FlashResources) {
    info!("Flash storage task started");

    let mut flash: StorageFlash = Flash::new(r.flash, r.dma);

    // Define flash range for storage
    let flash_range = STORAGE_OFFSET..(STORAGE_OFFSET + STORAGE_SIZE as u32);

    // Create cache for flash operations
    let mut cache = NoCache::new();

    // Both records are below 16 bytes plus key and item header
    let mut data_buffer: [u8; 128] = [0; 128];

    loop {
        let command = receive_flash_command().await;
        debug!("Flash command received: {:?}", command);

        match command {
            FlashCommand::Load(RecordKind::ContactorSettings) => {
                let settings = fetch_or_default::<ContactorSettings>(
                    &mut flash,
                    flash_range.clone(),
                    &mut cache,
                    &mut data_buffer,
                    StorageKey::ContactorSettings,
                )
                .await;
                info!(
                    "Contactor settings: strategy={}, tolerance={}V, timeout={}ms",
                    settings.strategy.as_str(),
                    settings.voltage_match_tolerance,
                    settings.voltage_match_timeout_ms
                );
                CONTACTOR_SETTINGS_SIGNAL.signal(settings);
            }

            FlashCommand::Load(RecordKind::ChargeSeed) => {
                let seed = fetch_or_default::<ChargeEstimatorSeed>(
                    &mut flash,
                    flash_range.clone(),
                    &mut cache,
                    &mut data_buffer,
                    StorageKey::ChargeSeed,
                )
                .await;
                info!(
                    "Charge seed: capacity={}As, charge={}As, recalibrating={}",
                    seed.capacity_estimate, seed.accumulated_charge_init, seed.recalibration_active
                );
                CHARGE_SEED_SIGNAL.signal(seed);
            }

            FlashCommand::SaveContactorSettings(settings) => {
                info!("Saving contactor settings to flash...");
                match store_item(
                    &mut flash,
                    flash_range.clone(),
                    &mut cache,
                    &mut data_buffer,
                    &StorageKey::ContactorSettings,
                    &settings,
                )
                .await
                {
                    Ok(_) => info!("Contactor settings saved successfully"),
                    Err(e) => error!("Failed to save contactor settings: {}", defmt::Debug2Format(&e)),
                }
            }

            FlashCommand::SaveChargeSeed(seed) => {
                match store_item(
                    &mut flash,
                    flash_range.clone(),
                    &mut cache,
                    &mut data_buffer,
                    &StorageKey::ChargeSeed,
                    &seed,
                )
                .await
                {
                    Ok(_) => debug!("Charge seed saved"),
                    Err(e) => error!("Failed to save charge seed: {}", defmt::Debug2Format(&e)),
                }
            }

            FlashCommand::EraseAll => {
                info!("Erasing all stored data...");
                match flash.erase(flash_range.start, flash_range.end).await {
                    Ok(_) => info!("Storage erased successfully"),
                    Err(e) => error!("Failed to erase storage: {}", defmt::Debug2Format(&e)),
                }
            }
        }

        // Small delay to prevent tight loop
        Timer::after(Duration::from_millis(10)).await;
    }
}

/// Reads one record, logging and replacing missing or corrupt data with the default
async fn fetch_or_default<V>(
    flash: &mut StorageFlash,
    flash_range: core::ops::Range<u32>,
    cache: &mut NoCache,
    data_buffer: &mut [u8],
    key: StorageKey,
) -> V
where
    V: for<'d> Value<'d> + Default,
{
    match fetch_item::<StorageKey, V, _>(flash, flash_range, cache, data_buffer, &key).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            info!("No {} record in flash, using defaults", key);
            V::default()
        }
        Err(e) => {
            error!("Failed to load {}: {}, using defaults", key, defmt::Debug2Format(&e));
            V::default()
        }
    }
}
