//! System initialization and clock configuration for the STM32H755 Cortex-M7 core.
//!
//! The M7 core owns clock setup; the M4 core picks the frozen clocks up from the shared
//! block in D3 SRAM.

use core::mem::MaybeUninit;

use embassy_stm32::{rcc::*, Config, Peripherals, SharedData};

/// Clock state shared with the second core
#[link_section = ".ram_d3.shared_data"]
static SHARED_DATA: MaybeUninit<SharedData> = MaybeUninit::uninit();

/// Initialize the STM32H755 with its high-performance clock tree.
///
/// - **480 MHz** system clock using PLL1 from HSI
/// - **240 MHz** AHB clock
/// - **120 MHz** APB clocks, so TIM1 and the I²C/SPI kernels run from 240/120 MHz
/// - **Scale0** voltage scaling, supplied from the internal SMPS
///
/// # Returns
///
/// The initialized [`Peripherals`] struct containing all STM32 peripheral instances.
pub fn init_system() -> Peripherals {
    let mut config = Config::default();

    // Enable high-speed internal oscillator (16 MHz)
    config.rcc.hsi = Some(HSIPrescaler::DIV1);

    // Enable low-power internal oscillator for backup
    config.rcc.csi = true;

    // PLL1 = HSI(16MHz) / DIVM1(4) * DIVN1(60) / DIVP1(2) = 480MHz
    config.rcc.pll1 = Some(Pll {
        source: PllSource::HSI,
        prediv: PllPreDiv::DIV4,
        mul: PllMul::MUL60,
        divp: Some(PllDiv::DIV2),
        divq: None,
        divr: None,
    });

    config.rcc.sys = Sysclk::PLL1_P; // 480 MHz system clock
    config.rcc.ahb_pre = AHBPrescaler::DIV2; // 240 MHz AHB clock
    config.rcc.apb1_pre = APBPrescaler::DIV2; // 120 MHz APB1 clock
    config.rcc.apb2_pre = APBPrescaler::DIV2; // 120 MHz APB2 clock
    config.rcc.apb3_pre = APBPrescaler::DIV2; // 120 MHz APB3 clock
    config.rcc.apb4_pre = APBPrescaler::DIV2; // 120 MHz APB4 clock

    // Maximum voltage scaling for 480MHz operation
    config.rcc.voltage_scale = VoltageScale::Scale0;
    config.rcc.supply_config = SupplyConfig::DirectSMPS;

    embassy_stm32::init_primary(config, &SHARED_DATA)
}
