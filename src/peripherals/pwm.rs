//! TIM1 PWM driving the RGB status LED.

use embassy_stm32::{
    gpio::OutputType,
    peripherals::{PE11, PE13, PE14, TIM1},
    time::Hertz,
    timer::{
        low_level::CountingMode,
        simple_pwm::{PwmPin, SimplePwm, SimplePwmChannel},
    },
    Peri,
};

use crate::config::PwmConfig;

/// TIM1 kernel clock: APB2 (120 MHz) doubled by the timer multiplier
const TIM1_CLOCK_HZ: u32 = 240_000_000;

/// Channels 2, 3 and 4 of TIM1 drive red, green and blue
pub struct RgbClaims<'d> {
    pub tim1: Peri<'d, TIM1>,
    pub red: Peri<'d, PE11>,   // TIM1_CH2
    pub green: Peri<'d, PE13>, // TIM1_CH3
    pub blue: Peri<'d, PE14>,  // TIM1_CH4
}

#[macro_export]
macro_rules! claim_rgb {
    ($peripherals:expr) => {{
        $crate::peripherals::pwm::RgbClaims {
            tim1: $peripherals.TIM1,
            red: $peripherals.PE11,
            green: $peripherals.PE13,
            blue: $peripherals.PE14,
        }
    }};
}

pub struct RgbChannels<'d> {
    pub red: SimplePwmChannel<'d, TIM1>,
    pub green: SimplePwmChannel<'d, TIM1>,
    pub blue: SimplePwmChannel<'d, TIM1>,
}

/// Start TIM1 at the update rate `config` describes and enable the three channels in
/// PWM mode 1.
pub fn rgb_pwm<'d>(claims: RgbClaims<'d>, config: &PwmConfig) -> RgbChannels<'d> {
    let ticks = u32::from(config.prescaler) * u32::from(config.period) * u32::from(config.clock_division);
    let frequency = Hertz(TIM1_CLOCK_HZ / ticks.max(1));
    let mode = if config.counting_up {
        CountingMode::EdgeAlignedUp
    } else {
        CountingMode::EdgeAlignedDown
    };

    let pwm = SimplePwm::new(
        claims.tim1,
        None,
        Some(PwmPin::new(claims.red, OutputType::PushPull)),
        Some(PwmPin::new(claims.green, OutputType::PushPull)),
        Some(PwmPin::new(claims.blue, OutputType::PushPull)),
        frequency,
        mode,
    );

    let channels = pwm.split();
    let mut rgb = RgbChannels {
        red: channels.ch2,
        green: channels.ch3,
        blue: channels.ch4,
    };
    rgb.red.enable();
    rgb.green.enable();
    rgb.blue.enable();
    rgb
}
