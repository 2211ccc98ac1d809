//! I²C bus of the battery charger.

use embassy_stm32::{
    bind_interrupts,
    gpio::{Level, Output, Speed},
    i2c::{self, I2c, Master},
    mode::Async,
    peripherals::{self as stm32_peripherals, DMA1_CH4, DMA1_CH5, I2C1, PB8, PB9, PE8},
    time::Hertz,
    Peri,
};

use crate::drivers::bq25150::Bq25150;

/// Peripheral collection for the charger
pub struct ChargerClaims<'d> {
    pub i2c1: Peri<'d, I2C1>,
    pub scl: Peri<'d, PB8>,
    pub sda: Peri<'d, PB9>,
    pub dma_tx: Peri<'d, DMA1_CH4>,
    pub dma_rx: Peri<'d, DMA1_CH5>,
    pub charge_enable: Peri<'d, PE8>, // /CE, active low
}

/// Macro to claim peripherals for the charger
#[macro_export]
macro_rules! claim_charger {
    ($peripherals:expr) => {{
        $crate::peripherals::i2c::ChargerClaims {
            i2c1: $peripherals.I2C1,
            scl: $peripherals.PB8,
            sda: $peripherals.PB9,
            dma_tx: $peripherals.DMA1_CH4,
            dma_rx: $peripherals.DMA1_CH5,
            charge_enable: $peripherals.PE8,
        }
    }};
}

bind_interrupts!(
    /// Charger bus interrupt handlers
    pub struct ChargerBusInterrupts {
        I2C1_EV => i2c::EventInterruptHandler<stm32_peripherals::I2C1>;
        I2C1_ER => i2c::ErrorInterruptHandler<stm32_peripherals::I2C1>;
    }
);

/// BQ25150 supports fast-mode I²C
const CHARGER_BUS_FREQUENCY: Hertz = Hertz(400_000);

pub type ChargerBus<'d> = I2c<'d, Async, Master>;
pub type ChargerDevice<'d> = Bq25150<ChargerBus<'d>, Output<'d>>;

/// Build the charger driver. The charge-enable line starts high, i.e. charging disabled.
pub fn charger_device(claims: ChargerClaims<'_>) -> ChargerDevice<'_> {
    let mut config = i2c::Config::default();
    config.frequency = CHARGER_BUS_FREQUENCY;

    let bus = I2c::new(
        claims.i2c1,
        claims.scl,
        claims.sda,
        ChargerBusInterrupts,
        claims.dma_tx,
        claims.dma_rx,
        config,
    );
    let charge_enable = Output::new(claims.charge_enable, Level::High, Speed::Low);

    Bq25150::new(bus, charge_enable)
}
