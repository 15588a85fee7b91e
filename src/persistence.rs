//! Flash record encoding
//!
//! Keys and values for the `sequential-storage` map kept in the flash tail.
//! Every record starts with a format version byte followed by little-endian
//! fields, so a layout change can be detected instead of misread.

use sequential_storage::map::{Key, SerializationError, Value};

use crate::bms::coulomb_counting::ChargeEstimatorSeed;
use crate::bms::precharge::StrategyKind;
use crate::settings::ContactorSettings;

/// Current layout of [`ContactorSettings`] records
const CONTACTOR_SETTINGS_VERSION: u8 = 1;
const CONTACTOR_SETTINGS_LEN: usize = 10;

/// Current layout of [`ChargeEstimatorSeed`] records
const CHARGE_SEED_VERSION: u8 = 1;
const CHARGE_SEED_LEN: usize = 14;

/// Storage keys for sequential-storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StorageKey {
    ContactorSettings = 0,
    ChargeSeed = 1,
}

impl Key for StorageKey {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.is_empty() {
            return Err(SerializationError::BufferTooSmall);
        }
        buffer[0] = *self as u8;
        Ok(1)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<(Self, usize), SerializationError>
    where
        Self: Sized,
    {
        if buffer.is_empty() {
            return Err(SerializationError::BufferTooSmall);
        }
        match buffer[0] {
            0 => Ok((StorageKey::ContactorSettings, 1)),
            1 => Ok((StorageKey::ChargeSeed, 1)),
            _ => Err(SerializationError::InvalidFormat),
        }
    }
}

/// Precharge strategy, tolerance (V) and voltage match timeout (ms)
impl Value<'_> for ContactorSettings {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.len() < CONTACTOR_SETTINGS_LEN {
            return Err(SerializationError::BufferTooSmall);
        }

        buffer[0] = CONTACTOR_SETTINGS_VERSION;
        buffer[1] = self.strategy as u8;
        buffer[2..6].copy_from_slice(&self.voltage_match_tolerance.to_le_bytes());
        buffer[6..10].copy_from_slice(&self.voltage_match_timeout_ms.to_le_bytes());

        Ok(CONTACTOR_SETTINGS_LEN)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        if buffer.len() < CONTACTOR_SETTINGS_LEN {
            return Err(SerializationError::BufferTooSmall);
        }
        if buffer[0] != CONTACTOR_SETTINGS_VERSION {
            return Err(SerializationError::InvalidFormat);
        }

        let strategy =
            StrategyKind::try_from(buffer[1]).map_err(|_| SerializationError::InvalidFormat)?;
        let settings = ContactorSettings {
            strategy,
            voltage_match_tolerance: read_f32(&buffer[2..6])?,
            voltage_match_timeout_ms: u32::from_le_bytes([
                buffer[6], buffer[7], buffer[8], buffer[9],
            ]),
        };
        settings
            .validate()
            .map_err(|_| SerializationError::InvalidData)?;
        Ok(settings)
    }
}

/// Capacity, charge baseline and recalibration latch of the charge estimator
impl Value<'_> for ChargeEstimatorSeed {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.len() < CHARGE_SEED_LEN {
            return Err(SerializationError::BufferTooSmall);
        }

        buffer[0] = CHARGE_SEED_VERSION;
        buffer[1] = u8::from(self.recalibration_active);
        buffer[2..6].copy_from_slice(&self.capacity_estimate.to_le_bytes());
        buffer[6..10].copy_from_slice(&self.accumulated_charge_init.to_le_bytes());
        buffer[10..14].copy_from_slice(&self.recalibration_start_charge.to_le_bytes());

        Ok(CHARGE_SEED_LEN)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<Self, SerializationError>
    where
        Self: Sized,
    {
        if buffer.len() < CHARGE_SEED_LEN {
            return Err(SerializationError::BufferTooSmall);
        }
        if buffer[0] != CHARGE_SEED_VERSION {
            return Err(SerializationError::InvalidFormat);
        }

        let recalibration_active = match buffer[1] {
            0 => false,
            1 => true,
            _ => return Err(SerializationError::InvalidFormat),
        };
        Ok(ChargeEstimatorSeed {
            capacity_estimate: read_f32(&buffer[2..6])?,
            accumulated_charge_init: read_f32(&buffer[6..10])?,
            recalibration_active,
            recalibration_start_charge: read_f32(&buffer[10..14])?,
        })
    }
}

/// Reads a little-endian f32, rejecting NaN and infinities
fn read_f32(bytes: &[u8]) -> Result<f32, SerializationError> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| SerializationError::BufferTooSmall)?;
    let value = f32::from_le_bytes(raw);
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SerializationError::InvalidFormat)
    }
}
