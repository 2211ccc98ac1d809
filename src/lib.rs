//! Service fabric of the data acquisition instrument firmware.
//!
//! Every service (charger, EEZ-DIB bridge, system supervisor) is a singleton built on
//! [`service::ServiceCore`]: callers write parameters under a guard and wait for the
//! service's worker, which alone touches the hardware. Board code is only compiled with
//! the `hardware` feature; everything else builds and tests on the host.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod apps;
pub mod config;
pub mod drivers;
pub mod peripherals;
pub mod service;

#[cfg(feature = "hardware")]
pub mod board;

#[cfg(test)]
mod testing;
