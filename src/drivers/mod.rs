//! Device drivers for the instrument.
//!
//! This module contains drivers for the external chips the services talk to.

/// BQ25150 battery charger driver
pub mod bq25150;
