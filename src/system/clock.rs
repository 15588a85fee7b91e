//! Monotonic millisecond clock backed by the embassy time driver

use embassy_time::Instant;
use ev_bms::clock::{Clock, Millis};

/// Millisecond counter shared by every state machine in the firmware.
///
/// Truncated to 32 bits; all consumers compare timestamps with wrapping
/// subtraction so the rollover after ~49 days is harmless.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        Instant::now().as_millis() as Millis
    }
}
