//! Firmware entry point for the Cortex-M7 application core.
//!
//! Board bring-up and task wiring live in [`daq_fw::board`]; the supervisor it spawns
//! sequences the rest of the boot.

#![no_std]
#![no_main]

use embassy_executor::Spawner;

// Import panic handler and defmt RTT for debugging
#[cfg(not(feature = "debug"))]
use panic_halt as _;
#[cfg(feature = "debug")]
use {defmt_rtt as _, panic_probe as _};

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    daq_fw::board::run(spawner).await
}
