//! Texas Instruments BQ25150 battery charger
//!
//! The charger sits on I²C at 0x6B with one open-drain interrupt line and an active-low
//! charge-enable input. [`driver`] holds the bus-level operations, [`registers`] the
//! register map subset and value conversions.

pub mod driver;
pub mod registers;

pub use driver::{Bq25150, ChargerError};
pub use registers::{ChargerFlags, InputCurrentLimit, InterruptMasks, InterruptSnapshot};
