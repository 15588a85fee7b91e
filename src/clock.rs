//! Monotonic time source
//!
//! All components read time through [`Clock`] so the firmware can back it with
//! the embassy time driver while tests step a counter by hand. Timestamps are
//! plain `u32` milliseconds and wrap after ~49 days; durations are always
//! computed with [`elapsed_ms`], never by comparing timestamps directly.

/// Milliseconds since an arbitrary epoch, wrapping on overflow.
pub type Millis = u32;

/// Monotonic millisecond clock
pub trait Clock {
    /// Current time in milliseconds
    fn now_ms(&self) -> Millis;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> Millis {
        (**self).now_ms()
    }
}

/// Time elapsed from `since` to `now`, correct across counter wraparound.
pub fn elapsed_ms(now: Millis, since: Millis) -> u32 {
    now.wrapping_sub(since)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Clock, Millis};
    use core::cell::Cell;
    use std::rc::Rc;

    /// Hand-stepped clock shared between a test and the components it drives
    #[derive(Clone, Default)]
    pub struct TestClock(Rc<Cell<Millis>>);

    impl TestClock {
        pub fn at(ms: Millis) -> Self {
            Self(Rc::new(Cell::new(ms)))
        }

        pub fn set(&self, ms: Millis) {
            self.0.set(ms);
        }

        pub fn advance(&self, ms: u32) {
            self.0.set(self.0.get().wrapping_add(ms));
        }
    }

    impl Clock for TestClock {
        fn now_ms(&self) -> Millis {
            self.0.get()
        }
    }
}
