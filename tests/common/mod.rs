//! Hardware doubles for driving the public API from integration tests

#![allow(dead_code)]

use std::cell::Cell;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use ev_bms::clock::{Clock, Millis};

/// Millisecond clock the test steps by hand
#[derive(Clone, Default)]
pub struct ManualClock(Rc<Cell<Millis>>);

impl ManualClock {
    pub fn now(&self) -> Millis {
        self.0.get()
    }

    pub fn advance(&self, ms: u32) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.0.get()
    }
}

/// Contactor coil with an auxiliary contact that closes to ground while
/// the coil is energised
#[derive(Clone, Default)]
pub struct Coil(Rc<Cell<bool>>);

impl Coil {
    pub fn driver(&self) -> CoilDriver {
        CoilDriver(self.0.clone())
    }

    pub fn aux_contact(&self) -> Sense {
        Sense {
            level: self.0.clone(),
            inverted: true,
        }
    }

    pub fn energised(&self) -> bool {
        self.0.get()
    }
}

pub struct CoilDriver(Rc<Cell<bool>>);

impl ErrorType for CoilDriver {
    type Error = Infallible;
}

impl OutputPin for CoilDriver {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set(true);
        Ok(())
    }
}

/// Digital input reading a shared level, optionally inverted
#[derive(Clone)]
pub struct Sense {
    level: Rc<Cell<bool>>,
    inverted: bool,
}

impl Sense {
    pub fn fixed(high: bool) -> Self {
        Self {
            level: Rc::new(Cell::new(high)),
            inverted: false,
        }
    }
}

impl ErrorType for Sense {
    type Error = Infallible;
}

impl InputPin for Sense {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level.get() != self.inverted)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level.get() == self.inverted)
    }
}
