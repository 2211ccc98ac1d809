//! SPI link to the EEZ-DIB companion board.
//!
//! SPI1 runs as slave in mode 0 (CPOL=0, CPHA=0); the companion board drives the clock
//! and frames every exchange. Frames move through DMA buffers in AXI SRAM.

use embassy_stm32::{
    mode::Async,
    pac,
    peripherals::{DMA1_CH2, DMA1_CH3, PA5, PA6, PB5, SPI1},
    spi::{self, Config as SpiConfig, Mode, Phase, Polarity, Spi},
    Peri,
};
use static_cell::ConstStaticCell;

use crate::peripherals::FrameTransport;

/// Largest frame the DMA buffers hold
pub const MAX_FRAME: usize = 32;

/// Peripheral collection for the EEZ-DIB link
pub struct EezSpiClaims<'d> {
    pub spi1: Peri<'d, SPI1>,
    pub sck: Peri<'d, PA5>,         // SCK, driven by the peer
    pub miso: Peri<'d, PA6>,        // MISO, our transmit line
    pub mosi: Peri<'d, PB5>,        // MOSI, our receive line
    pub dma_tx: Peri<'d, DMA1_CH2>, // TX DMA
    pub dma_rx: Peri<'d, DMA1_CH3>, // RX DMA
    pub frames: &'d mut EezFrames,
}

/// Macro to claim peripherals for the EEZ-DIB link
#[macro_export]
macro_rules! claim_eez_spi {
    ($peripherals:expr) => {{
        $crate::peripherals::spi::EezSpiClaims {
            spi1: $peripherals.SPI1,
            sck: $peripherals.PA5,
            miso: $peripherals.PA6,
            mosi: $peripherals.PB5,
            dma_tx: $peripherals.DMA1_CH2,
            dma_rx: $peripherals.DMA1_CH3,
            frames: $crate::peripherals::spi::EEZ_FRAMES.take(),
        }
    }};
}

/// DMA frame buffers, cache-line aligned.
#[repr(C, align(32))]
pub struct EezFrames {
    pub tx: [u8; MAX_FRAME],
    pub rx: [u8; MAX_FRAME],
}

impl EezFrames {
    pub const fn new() -> Self {
        Self {
            tx: [0; MAX_FRAME],
            rx: [0; MAX_FRAME],
        }
    }
}

impl Default for EezFrames {
    fn default() -> Self {
        Self::new()
    }
}

pub static EEZ_FRAMES: ConstStaticCell<EezFrames> = ConstStaticCell::new(EezFrames::new());

/// SPI slave endpoint exchanging fixed-size frames.
pub struct EezSpiLink<'d> {
    spi: Spi<'d, Async>,
    frames: &'d mut EezFrames,
}

impl<'d> EezSpiLink<'d> {
    pub fn new(claims: EezSpiClaims<'d>) -> Self {
        let mut config = SpiConfig::default();
        config.mode = Mode {
            polarity: Polarity::IdleLow,
            phase: Phase::CaptureOnFirstTransition,
        };

        let spi = Spi::new(
            claims.spi1,
            claims.sck,
            claims.mosi,
            claims.miso,
            claims.dma_tx,
            claims.dma_rx,
            config,
        );

        // The driver only configures master mode; hand the clock to the peer with the
        // peripheral disabled. Slave select is internal, so the link is always selected.
        let regs = pac::SPI1;
        regs.cr1().modify(|w| w.set_spe(false));
        regs.cfg2().modify(|w| {
            w.set_master(false);
            w.set_ssm(true);
        });
        regs.cr1().modify(|w| w.set_ssi(false));

        Self {
            spi,
            frames: claims.frames,
        }
    }
}

impl FrameTransport for EezSpiLink<'_> {
    type Error = spi::Error;

    async fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        let len = tx.len().min(rx.len()).min(MAX_FRAME);
        self.frames.tx[..len].copy_from_slice(&tx[..len]);

        self.spi
            .transfer(&mut self.frames.rx[..len], &self.frames.tx[..len])
            .await?;

        rx[..len].copy_from_slice(&self.frames.rx[..len]);
        Ok(())
    }
}
