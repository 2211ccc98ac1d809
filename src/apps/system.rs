//! System supervisor.
//!
//! Boots the board one step at a time, owns the status indicators and is the central
//! error sink every other service reports to. Boot stops at the first failing step and
//! leaves the supervisor in `Error` with the error LED on and the RGB LED red.
//!
//! Worker event order within one wake: `RGB_SET_COLOR`, `SET_LINK_STATUS`,
//! `REPORT_ERROR`, `ACQUISITION_CHANGED`.

use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_time::Duration;
use embedded_hal::digital::OutputPin;
use embedded_hal::pwm::SetDutyCycle;
use heapless::String;

use crate::apps::eez_dib::EezDibService;
use crate::apps::sstream::{AcquisitionListener, StreamAcquisition, StreamId};
use crate::config::{PwmConfig, SystemConfig, API_TIMEOUT, RGB_PWM};
use crate::service::{park, ErrorLevel, ErrorSink, ServiceCore, ServiceError, ServiceState};

pub const DEVICE_NAME_CAPACITY: usize = 32;
pub type DeviceName = String<DEVICE_NAME_CAPACITY>;

/// Acquisition changes buffered between the sample stream and the worker
const ACQUISITION_QUEUE_DEPTH: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SystemEvents: u32 {
        const RGB_SET_COLOR = 1 << 0;
        const SET_LINK_STATUS = 1 << 1;
        const REPORT_ERROR = 1 << 2;
        const ACQUISITION_CHANGED = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const OFF: Color = Color::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IndicatorError {
    Pin,
    Pwm,
    /// RGB PWM not started, or started with an empty period
    PwmPeriod,
}

/// Status LEDs and the RGB LED.
pub trait Indicators {
    fn init_status_leds(&mut self) -> Result<(), IndicatorError>;
    fn start_rgb(&mut self, config: &PwmConfig) -> Result<(), IndicatorError>;
    fn set_link_led(&mut self, on: bool) -> Result<(), IndicatorError>;
    fn set_error_led(&mut self, on: bool) -> Result<(), IndicatorError>;
    fn set_rgb(&mut self, color: Color) -> Result<(), IndicatorError>;
}

/// Indicators on two GPIO lines and three PWM channels.
///
/// A colour component is a compare value against the configured PWM period, so with a
/// period of 256 the components 0..=255 span 0..100 % duty. Channels whose counter runs
/// at a different resolution are scaled to the same duty.
pub struct StatusIndicators<L, E, R, G, B> {
    link: L,
    error: E,
    red: R,
    green: G,
    blue: B,
    /// Set by `start_rgb`
    period: u16,
}

impl<L, E, R, G, B> StatusIndicators<L, E, R, G, B>
where
    L: OutputPin,
    E: OutputPin,
    R: SetDutyCycle,
    G: SetDutyCycle,
    B: SetDutyCycle,
{
    pub fn new(link: L, error: E, red: R, green: G, blue: B) -> Self {
        Self {
            link,
            error,
            red,
            green,
            blue,
            period: 0,
        }
    }
}

fn drive<P: OutputPin>(pin: &mut P, on: bool) -> Result<(), IndicatorError> {
    let result = if on { pin.set_high() } else { pin.set_low() };
    result.map_err(|_| IndicatorError::Pin)
}

fn set_component<C: SetDutyCycle>(channel: &mut C, value: u8, period: u16) -> Result<(), IndicatorError> {
    let duty = u32::from(value) * u32::from(channel.max_duty_cycle()) / u32::from(period);
    let duty = u16::try_from(duty).map_err(|_| IndicatorError::PwmPeriod)?;
    channel.set_duty_cycle(duty).map_err(|_| IndicatorError::Pwm)
}

impl<L, E, R, G, B> Indicators for StatusIndicators<L, E, R, G, B>
where
    L: OutputPin,
    E: OutputPin,
    R: SetDutyCycle,
    G: SetDutyCycle,
    B: SetDutyCycle,
{
    fn init_status_leds(&mut self) -> Result<(), IndicatorError> {
        drive(&mut self.link, false)?;
        drive(&mut self.error, false)
    }

    fn start_rgb(&mut self, config: &PwmConfig) -> Result<(), IndicatorError> {
        let counters = [
            self.red.max_duty_cycle(),
            self.green.max_duty_cycle(),
            self.blue.max_duty_cycle(),
        ];
        if config.period == 0 || counters.contains(&0) {
            return Err(IndicatorError::PwmPeriod);
        }
        self.period = config.period;
        self.set_rgb(Color::OFF)
    }

    fn set_link_led(&mut self, on: bool) -> Result<(), IndicatorError> {
        drive(&mut self.link, on)
    }

    fn set_error_led(&mut self, on: bool) -> Result<(), IndicatorError> {
        drive(&mut self.error, on)
    }

    fn set_rgb(&mut self, color: Color) -> Result<(), IndicatorError> {
        if self.period == 0 {
            return Err(IndicatorError::PwmPeriod);
        }
        set_component(&mut self.red, color.r, self.period)?;
        set_component(&mut self.green, color.g, self.period)?;
        set_component(&mut self.blue, color.b, self.period)
    }
}

/// Steps of the boot sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootStep {
    Drivers,
    StatusLeds,
    UserButton,
    RgbPwm,
    Logging,
    Charger,
    EnergyDebugger,
    Network,
    Control,
    SampleStream,
    DischargeControl,
    EezDib,
    AcquisitionListener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootCause {
    /// Board-level peripheral bring-up failed
    Peripheral,
    Indicator(IndicatorError),
    /// A service did not reach `Service`
    Service(ServiceError),
    /// An external subsystem refused to start
    Subsystem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootError {
    pub step: BootStep,
    pub cause: BootCause,
}

/// Board and subsystem bring-up driven by the supervisor.
#[allow(async_fn_in_trait)]
pub trait Platform {
    async fn init_drivers(&mut self) -> Result<(), BootCause>;
    async fn register_user_button(&mut self) -> Result<(), BootCause>;
    async fn init_logging(&mut self) -> Result<(), BootCause>;
    /// Start the charger service and wait until it serves
    async fn init_charger(&mut self) -> Result<(), BootCause>;
    async fn init_energy_debugger(&mut self) -> Result<(), BootCause>;
    async fn init_network(&mut self) -> Result<(), BootCause>;
    async fn init_control(&mut self) -> Result<(), BootCause>;
    async fn init_sample_stream(&mut self) -> Result<(), BootCause>;
    async fn init_discharge_control(&mut self) -> Result<(), BootCause>;
    /// Start the EEZ-DIB bridge and wait until it serves
    async fn init_eez_dib(&mut self) -> Result<(), BootCause>;
    async fn register_acquisition_listener(
        &mut self,
        listener: &'static dyn AcquisitionListener,
    ) -> Result<(), BootCause>;
}

#[derive(Debug, Clone)]
struct SystemBlock {
    link_status: LinkStatus,
    rgb: Color,
    device_name: DeviceName,
}

pub struct SystemService {
    core: ServiceCore<SystemBlock, SystemEvents>,
    /// Most recent reported level, 0 when nothing was reported
    last_error: AtomicU8,
    acquisition: Channel<CriticalSectionRawMutex, (StreamId, StreamAcquisition), ACQUISITION_QUEUE_DEPTH>,
}

impl SystemService {
    pub const fn new() -> Self {
        Self {
            core: ServiceCore::new(
                "system",
                SystemBlock {
                    link_status: LinkStatus::Down,
                    rgb: Color::OFF,
                    device_name: String::new(),
                },
            ),
            last_error: AtomicU8::new(0),
            acquisition: Channel::new(),
        }
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ServiceError> {
        self.core.wait_ready(timeout).await
    }

    pub fn state(&self) -> ServiceState {
        self.core.state()
    }

    pub async fn set_link_status(&self, status: LinkStatus, timeout: Duration) -> Result<(), ServiceError> {
        self.core
            .request(SystemEvents::SET_LINK_STATUS, timeout, |b| b.link_status = status)
            .await
    }

    pub async fn link_status(&self, timeout: Duration) -> Result<LinkStatus, ServiceError> {
        self.core.read(timeout, |b| b.link_status).await
    }

    pub async fn set_rgb(&self, color: Color, timeout: Duration) -> Result<(), ServiceError> {
        self.core
            .request(SystemEvents::RGB_SET_COLOR, timeout, |b| b.rgb = color)
            .await
    }

    pub async fn rgb(&self, timeout: Duration) -> Result<Color, ServiceError> {
        self.core.read(timeout, |b| b.rgb).await
    }

    pub async fn set_device_name(&self, name: &str, timeout: Duration) -> Result<(), ServiceError> {
        let name = DeviceName::try_from(name).map_err(|_| ServiceError::InvalidArgument)?;
        self.core.write(timeout, |b| b.device_name = name).await
    }

    pub async fn device_name(&self, timeout: Duration) -> Result<DeviceName, ServiceError> {
        self.core.read(timeout, |b| b.device_name.clone()).await
    }

    /// Level of the most recent error report.
    pub fn last_error(&self) -> Option<ErrorLevel> {
        ErrorLevel::from_raw(self.last_error.load(Ordering::Acquire))
    }

    /// Supervisor worker: boot, then serve indicator requests and forward acquisition
    /// changes to the bridge.
    pub async fn run<P, I>(
        &'static self,
        platform: &mut P,
        indicators: &mut I,
        eez: &EezDibService,
        config: &SystemConfig,
    ) -> !
    where
        P: Platform,
        I: Indicators,
    {
        info!("system: booting");

        if let Err(e) = self.boot(platform, indicators, config).await {
            error!("system: boot failed at {:?}: {:?}", e.step, e.cause);
            self.core.mark_failed();
            self.show_error(indicators, config).await;
            park().await
        }

        if let Err(e) = indicators.set_rgb(config.boot_color) {
            warn!("system: unable to set boot colour: {:?}", e);
        }
        if let Err(e) = indicators.set_link_led(false) {
            warn!("system: unable to clear link LED: {:?}", e);
        }
        let boot_color = config.boot_color;
        self.core
            .update(|b| {
                b.rgb = boot_color;
                b.link_status = LinkStatus::Down;
            })
            .await;
        self.core.enter_service();

        // Reports raised while booting were dropped with the pending notifications
        if self.last_error().is_some() {
            self.show_error(indicators, config).await;
        }

        loop {
            let events = self.core.next_events().await;

            if events.contains(SystemEvents::RGB_SET_COLOR) {
                let (block, through) = self.core.snapshot(SystemEvents::RGB_SET_COLOR).await;
                let result = indicators.set_rgb(block.rgb);
                if let Err(e) = result {
                    error!("system: unable to set RGB: {:?}", e);
                }
                self.core.complete(SystemEvents::RGB_SET_COLOR, through, result.is_ok());
            }
            if events.contains(SystemEvents::SET_LINK_STATUS) {
                let (block, through) = self.core.snapshot(SystemEvents::SET_LINK_STATUS).await;
                let result = indicators.set_link_led(block.link_status == LinkStatus::Up);
                if let Err(e) = result {
                    error!("system: unable to drive link LED: {:?}", e);
                }
                self.core.complete(SystemEvents::SET_LINK_STATUS, through, result.is_ok());
            }
            if events.contains(SystemEvents::REPORT_ERROR) {
                self.show_error(indicators, config).await;
            }
            if events.contains(SystemEvents::ACQUISITION_CHANGED) {
                while let Ok((stream, state)) = self.acquisition.try_receive() {
                    if let Err(e) = eez
                        .set_acquisition_state(state.into(), Some(stream), API_TIMEOUT)
                        .await
                    {
                        error!("system: unable to forward acquisition change: {:?}", e);
                    }
                }
            }
        }
    }

    async fn boot<P, I>(&'static self, platform: &mut P, indicators: &mut I, config: &SystemConfig) -> Result<(), BootError>
    where
        P: Platform,
        I: Indicators,
    {
        step(BootStep::Drivers, platform.init_drivers().await)?;
        step(
            BootStep::StatusLeds,
            indicators.init_status_leds().map_err(BootCause::Indicator),
        )?;
        step(BootStep::UserButton, platform.register_user_button().await)?;
        step(
            BootStep::RgbPwm,
            indicators.start_rgb(&RGB_PWM).map_err(BootCause::Indicator),
        )?;
        step(BootStep::Logging, platform.init_logging().await)?;
        step(BootStep::Charger, platform.init_charger().await)?;
        step(BootStep::EnergyDebugger, platform.init_energy_debugger().await)?;
        step(BootStep::Network, platform.init_network().await)?;
        step(BootStep::Control, platform.init_control().await)?;
        step(BootStep::SampleStream, platform.init_sample_stream().await)?;
        step(BootStep::DischargeControl, platform.init_discharge_control().await)?;
        step(BootStep::EezDib, platform.init_eez_dib().await)?;
        step(
            BootStep::AcquisitionListener,
            platform.register_acquisition_listener(self).await,
        )?;

        match DeviceName::try_from(config.device_name) {
            Ok(name) => self.core.update(|b| b.device_name = name).await,
            Err(_) => warn!("system: configured device name too long"),
        }
        Ok(())
    }

    async fn show_error<I: Indicators>(&self, indicators: &mut I, config: &SystemConfig) {
        if let Err(e) = indicators.set_rgb(config.error_color) {
            warn!("system: unable to set error colour: {:?}", e);
        }
        if let Err(e) = indicators.set_error_led(true) {
            warn!("system: unable to drive error LED: {:?}", e);
        }
        let error_color = config.error_color;
        self.core.update(|b| b.rgb = error_color).await;
    }
}

fn step(step: BootStep, result: Result<(), BootCause>) -> Result<(), BootError> {
    match result {
        Ok(()) => {
            info!("system: {:?} up", step);
            Ok(())
        }
        Err(cause) => Err(BootError { step, cause }),
    }
}

impl Default for SystemService {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorSink for SystemService {
    fn report_error(&self, level: ErrorLevel) {
        warn!("system: error reported, level {:?}", level);
        self.last_error.store(level as u8, Ordering::Release);
        self.core.notify(SystemEvents::REPORT_ERROR);
    }
}

impl AcquisitionListener for SystemService {
    fn acquisition_changed(&self, stream: StreamId, state: StreamAcquisition) {
        if self.acquisition.try_send((stream, state)).is_err() {
            warn!("system: acquisition change dropped");
            return;
        }
        self.core.notify(SystemEvents::ACQUISITION_CHANGED);
    }
}
