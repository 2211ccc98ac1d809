//! Discrete lines: status LEDs, user button and the charger interrupt.

use embassy_stm32::{
    exti::ExtiInput,
    gpio::{Level, Output, Pull, Speed},
    peripherals::{EXTI13, EXTI7, PB0, PB14, PC13, PE7},
    Peri,
};

pub struct StatusLedClaims<'d> {
    pub link: Peri<'d, PB0>,
    pub error: Peri<'d, PB14>,
}

#[macro_export]
macro_rules! claim_status_leds {
    ($peripherals:expr) => {{
        $crate::peripherals::gpio::StatusLedClaims {
            link: $peripherals.PB0,
            error: $peripherals.PB14,
        }
    }};
}

pub struct ButtonClaims<'d> {
    pub pin: Peri<'d, PC13>,
    pub exti: Peri<'d, EXTI13>,
}

#[macro_export]
macro_rules! claim_user_button {
    ($peripherals:expr) => {{
        $crate::peripherals::gpio::ButtonClaims {
            pin: $peripherals.PC13,
            exti: $peripherals.EXTI13,
        }
    }};
}

/// Charger INT, open drain, asserted low
pub struct ChargerIrqClaims<'d> {
    pub pin: Peri<'d, PE7>,
    pub exti: Peri<'d, EXTI7>,
}

#[macro_export]
macro_rules! claim_charger_irq {
    ($peripherals:expr) => {{
        $crate::peripherals::gpio::ChargerIrqClaims {
            pin: $peripherals.PE7,
            exti: $peripherals.EXTI7,
        }
    }};
}

/// Link and error LED outputs, both off.
pub fn status_leds(claims: StatusLedClaims<'_>) -> (Output<'_>, Output<'_>) {
    (
        Output::new(claims.link, Level::Low, Speed::Low),
        Output::new(claims.error, Level::Low, Speed::Low),
    )
}

pub fn user_button(claims: ButtonClaims<'_>) -> ExtiInput<'_> {
    ExtiInput::new(claims.pin, claims.exti, Pull::Down)
}

pub fn charger_irq(claims: ChargerIrqClaims<'_>) -> ExtiInput<'_> {
    ExtiInput::new(claims.pin, claims.exti, Pull::Up)
}
