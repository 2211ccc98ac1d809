//! Peripheral façade.
//!
//! Board-specific bring-up and peripheral claims only exist with the `hardware` feature.
//! The transport traits below are what the services see, so they build on the host too.

#[cfg(feature = "hardware")]
pub mod gpio;
#[cfg(feature = "hardware")]
pub mod i2c;
#[cfg(feature = "hardware")]
pub mod pwm;
#[cfg(feature = "hardware")]
pub mod spi;
#[cfg(feature = "hardware")]
pub mod system;

#[cfg(feature = "hardware")]
pub use system::init_system;

/// Full-duplex exchange of fixed-size frames where the peer drives the clock.
#[allow(async_fn_in_trait)]
pub trait FrameTransport {
    type Error: core::fmt::Debug;

    /// Arm `tx` for the next exchange and wait until the peer clocked a full frame into
    /// `rx`. Both buffers have the same length.
    async fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error>;
}
