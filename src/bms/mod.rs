//! Battery management core
//!
//! Hardware-free state machines ticked by the firmware tasks: contactor
//! control, precharge strategies, current integration and charge estimation.

use core::fmt;

pub mod contactor;
pub mod contactor_manager;
pub mod coulomb_counting;
pub mod current;
pub mod precharge;
pub mod soc_lookup;

/// Writes the set flag names of a DTC bitmask as `A, B`, or `NONE` when empty.
pub(crate) fn write_flag_names<T>(
    f: &mut fmt::Formatter<'_>,
    mut names: impl Iterator<Item = (&'static str, T)>,
) -> fmt::Result {
    match names.next() {
        None => f.write_str("NONE"),
        Some((first, _)) => {
            f.write_str(first)?;
            for (name, _) in names {
                write!(f, ", {name}")?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Pin doubles sharing their level with the test through an `Rc<Cell>`

    use core::cell::Cell;
    use core::convert::Infallible;
    use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
    use std::rc::Rc;

    /// Output pin whose driven level the test can observe
    #[derive(Clone, Default)]
    pub struct FakeOutput(Rc<Cell<bool>>);

    impl FakeOutput {
        pub fn is_set_high(&self) -> bool {
            self.0.get()
        }
    }

    impl ErrorType for FakeOutput {
        type Error = Infallible;
    }

    impl OutputPin for FakeOutput {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.0.set(true);
            Ok(())
        }
    }

    /// Input pin whose electrical level the test controls
    #[derive(Clone, Default)]
    pub struct FakeInput(Rc<Cell<bool>>);

    impl FakeInput {
        pub fn high() -> Self {
            Self(Rc::new(Cell::new(true)))
        }

        pub fn drive(&self, high: bool) {
            self.0.set(high);
        }
    }

    impl ErrorType for FakeInput {
        type Error = Infallible;
    }

    impl InputPin for FakeInput {
        fn is_high(&mut self) -> Result<bool, Self::Error> {
            Ok(self.0.get())
        }

        fn is_low(&mut self) -> Result<bool, Self::Error> {
            Ok(!self.0.get())
        }
    }
}
