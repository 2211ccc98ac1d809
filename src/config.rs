//! Compile-time configuration of the firmware services.

use embassy_time::Duration;

use crate::apps::charger::ChargerParameters;
use crate::apps::system::Color;
use crate::drivers::bq25150::InterruptMasks;

// ---- Service API -------------------------------------------------------------------

/// Default timeout for service API calls made by the firmware itself
pub const API_TIMEOUT: Duration = Duration::from_millis(100);

/// How long the supervisor waits for each service to finish initialization
pub const SERVICE_START_TIMEOUT: Duration = Duration::from_secs(3);

// ---- Charger -----------------------------------------------------------------------

/// What the charger service does with the interrupt mask registers during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InterruptMaskPolicy {
    /// Leave MASK0..MASK3 at their power-on values
    HardwareDefault,
    /// Program the given masks after the identity probe
    Apply(InterruptMasks),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargerConfig {
    /// Parameters pushed to the device during bring-up
    pub parameters: ChargerParameters,
    /// Total time spent retrying the identity probe
    pub probe_window: Duration,
    /// Delay between identity probe attempts
    pub probe_interval: Duration,
    pub mask_policy: InterruptMaskPolicy,
    /// Read back every configuration write
    pub verify_writes: bool,
    /// Upper bound on flag reads while draining one interrupt
    pub max_interrupt_passes: u8,
}

pub const CHARGER: ChargerConfig = ChargerConfig {
    parameters: ChargerParameters::DEFAULT,
    probe_window: Duration::from_secs(1),
    probe_interval: Duration::from_millis(100),
    mask_policy: InterruptMaskPolicy::HardwareDefault,
    verify_writes: true,
    max_interrupt_passes: 4,
};

// ---- RGB PWM -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PwmConfig {
    pub prescaler: u16,
    /// Counter period; a colour component maps to `component / period` duty
    pub period: u16,
    pub counting_up: bool,
    pub clock_division: u8,
}

pub const RGB_PWM: PwmConfig = PwmConfig {
    prescaler: 2000,
    period: 256,
    counting_up: true,
    clock_division: 1,
};

// ---- Supervisor --------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfig {
    /// RGB colour shown once boot completes
    pub boot_color: Color,
    /// RGB colour shown on any reported error
    pub error_color: Color,
    pub device_name: &'static str,
}

pub const SYSTEM: SystemConfig = SystemConfig {
    boot_color: Color::new(0, 0, 50),
    error_color: Color::new(50, 0, 0),
    device_name: "daq-fw",
};
