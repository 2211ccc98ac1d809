//! Battery charger service.
//!
//! Owns the BQ25150 on its worker. Callers change the desired charging parameters through
//! [`ChargerService`]; the worker pushes every change to the device and releases the
//! caller once the device accepted it. The charger's interrupt line feeds the same
//! worker through [`ChargerService::on_interrupt`].
//!
//! Within one wake the worker handles pending events lowest bit first:
//! `SET_CHARGING_STATUS`, `SET_CHARGING_CURRENT`, `SET_TERM_CURRENT`, `SET_TERM_VOLTAGE`,
//! `READ_REGISTER`, `PROCESS_INTERRUPT`, `SET_INPUT_CURRENT_LIMIT`, `SET_WATCHDOG`.

use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use embassy_time::{with_deadline, Duration, Instant, Timer};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::i2c::I2c;

use crate::apps::status_link::{MessageKind, StatusLink, CHARGE_DONE_MESSAGE, UNDERVOLTAGE_MESSAGE};
use crate::config::{ChargerConfig, InterruptMaskPolicy};
use crate::drivers::bq25150::registers::{
    charging_current_code, regulation_voltage_code, ITERM_MAX_PERCENT,
};
use crate::drivers::bq25150::{Bq25150, ChargerError, ChargerFlags, InputCurrentLimit, InterruptSnapshot};
use crate::service::{ErrorSink, ServiceCore, ServiceError, ServiceState};

bitflags! {
    /// Work items of the charger worker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChargerEvents: u32 {
        const SET_CHARGING_STATUS = 1 << 0;
        const SET_CHARGING_CURRENT = 1 << 1;
        const SET_TERM_CURRENT = 1 << 2;
        const SET_TERM_VOLTAGE = 1 << 3;
        const READ_REGISTER = 1 << 4;
        const PROCESS_INTERRUPT = 1 << 5;
        const SET_INPUT_CURRENT_LIMIT = 1 << 6;
        const SET_WATCHDOG = 1 << 7;
    }
}

/// Desired charging configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerParameters {
    /// Battery regulation voltage in volts
    pub termination_voltage: f32,
    /// Termination current in percent of the charging current
    pub termination_current: u8,
    /// Fast-charge current in mA
    pub charging_current: u16,
    pub input_current_limit: InputCurrentLimit,
    pub charging_enabled: bool,
    pub watchdog_enabled: bool,
}

impl ChargerParameters {
    pub const DEFAULT: Self = Self {
        termination_voltage: 4.35,
        termination_current: 5,
        charging_current: 100,
        input_current_limit: InputCurrentLimit::Ma200,
        charging_enabled: false,
        watchdog_enabled: false,
    };
}

impl Default for ChargerParameters {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Parameter block plus the worker's result slots.
#[derive(Debug, Clone, Copy)]
struct ChargerBlock {
    params: ChargerParameters,
    register_address: u8,
    register_value: u8,
    interrupts: InterruptSnapshot,
}

pub struct ChargerService {
    core: ServiceCore<ChargerBlock, ChargerEvents>,
    /// Serializes register readbacks from request to result
    readback: Mutex<CriticalSectionRawMutex, ()>,
    /// Set once the worker accepts interrupts
    irq_armed: AtomicBool,
}

impl ChargerService {
    pub const fn new() -> Self {
        Self {
            core: ServiceCore::new(
                "charger",
                ChargerBlock {
                    params: ChargerParameters::DEFAULT,
                    register_address: 0,
                    register_value: 0,
                    interrupts: InterruptSnapshot {
                        charger_flags: 0,
                        adc_flags: 0,
                        timer_flags: 0,
                    },
                },
            ),
            readback: Mutex::new(()),
            irq_armed: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.core.start();
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ServiceError> {
        self.core.wait_ready(timeout).await
    }

    pub fn state(&self) -> ServiceState {
        self.core.state()
    }

    // ---- setters -----------------------------------------------------------------

    pub async fn set_charging_enabled(&self, enabled: bool, timeout: Duration) -> Result<(), ServiceError> {
        self.core
            .request(ChargerEvents::SET_CHARGING_STATUS, timeout, |b| {
                b.params.charging_enabled = enabled
            })
            .await
    }

    pub async fn set_charging_current(&self, milliamps: u16, timeout: Duration) -> Result<(), ServiceError> {
        charging_current_code(milliamps).ok_or(ServiceError::InvalidArgument)?;
        self.core
            .request(ChargerEvents::SET_CHARGING_CURRENT, timeout, |b| {
                b.params.charging_current = milliamps
            })
            .await
    }

    pub async fn set_termination_current(&self, percent: u8, timeout: Duration) -> Result<(), ServiceError> {
        if percent > ITERM_MAX_PERCENT {
            return Err(ServiceError::InvalidArgument);
        }
        self.core
            .request(ChargerEvents::SET_TERM_CURRENT, timeout, |b| {
                b.params.termination_current = percent
            })
            .await
    }

    pub async fn set_termination_voltage(&self, volts: f32, timeout: Duration) -> Result<(), ServiceError> {
        regulation_voltage_code(volts).ok_or(ServiceError::InvalidArgument)?;
        self.core
            .request(ChargerEvents::SET_TERM_VOLTAGE, timeout, |b| {
                b.params.termination_voltage = volts
            })
            .await
    }

    pub async fn set_input_current_limit(
        &self,
        limit: InputCurrentLimit,
        timeout: Duration,
    ) -> Result<(), ServiceError> {
        self.core
            .request(ChargerEvents::SET_INPUT_CURRENT_LIMIT, timeout, |b| {
                b.params.input_current_limit = limit
            })
            .await
    }

    pub async fn set_watchdog_enabled(&self, enabled: bool, timeout: Duration) -> Result<(), ServiceError> {
        self.core
            .request(ChargerEvents::SET_WATCHDOG, timeout, |b| b.params.watchdog_enabled = enabled)
            .await
    }

    // ---- getters: in-memory values, the worker is not involved --------------------

    pub async fn charging_enabled(&self, timeout: Duration) -> Result<bool, ServiceError> {
        self.core.read(timeout, |b| b.params.charging_enabled).await
    }

    pub async fn charging_current(&self, timeout: Duration) -> Result<u16, ServiceError> {
        self.core.read(timeout, |b| b.params.charging_current).await
    }

    pub async fn termination_current(&self, timeout: Duration) -> Result<u8, ServiceError> {
        self.core.read(timeout, |b| b.params.termination_current).await
    }

    pub async fn termination_voltage(&self, timeout: Duration) -> Result<f32, ServiceError> {
        self.core.read(timeout, |b| b.params.termination_voltage).await
    }

    pub async fn input_current_limit(&self, timeout: Duration) -> Result<InputCurrentLimit, ServiceError> {
        self.core.read(timeout, |b| b.params.input_current_limit).await
    }

    pub async fn watchdog_enabled(&self, timeout: Duration) -> Result<bool, ServiceError> {
        self.core.read(timeout, |b| b.params.watchdog_enabled).await
    }

    pub async fn parameters(&self, timeout: Duration) -> Result<ChargerParameters, ServiceError> {
        self.core.read(timeout, |b| b.params).await
    }

    /// Flags seen while servicing the most recent interrupt, after local handling.
    pub async fn last_interrupt(&self, timeout: Duration) -> Result<InterruptSnapshot, ServiceError> {
        self.core.read(timeout, |b| b.interrupts).await
    }

    /// Read any device register through the worker. Every stage shares one deadline.
    pub async fn read_register(&self, address: u8, timeout: Duration) -> Result<u8, ServiceError> {
        let deadline = Instant::now() + timeout;
        let _serial = with_deadline(deadline, self.readback.lock())
            .await
            .map_err(|_| ServiceError::Timeout)?;
        self.core
            .request_until(ChargerEvents::READ_REGISTER, deadline, |b| b.register_address = address)
            .await?;
        self.core.read_until(deadline, |b| b.register_value).await
    }

    /// Charger interrupt line handler. Never blocks and never takes the guard.
    pub fn on_interrupt(&self) {
        if self.irq_armed.load(Ordering::Acquire) {
            self.core.notify_from_isr(ChargerEvents::PROCESS_INTERRUPT);
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self, event: ChargerEvents) -> u32 {
        self.core.outstanding(event)
    }

    // ---- worker ------------------------------------------------------------------

    /// Charger worker. Parks until [`start`](Self::start), brings the device up and
    /// then serves requests forever.
    pub async fn run<I2C, CE>(
        &self,
        mut device: Bq25150<I2C, CE>,
        config: &ChargerConfig,
        link: &dyn StatusLink,
        errors: &dyn ErrorSink,
    ) -> !
    where
        I2C: I2c,
        CE: OutputPin,
    {
        self.core.wait_started().await;
        debug!("charger: starting bring-up");

        if let Err(reason) = self.bring_up(&mut device, config).await {
            self.irq_armed.store(false, Ordering::Release);
            self.core.fail(errors, reason).await
        }
        self.core.enter_service();

        // Flags latched during bring-up would otherwise keep the line asserted
        self.process_interrupt(&mut device, config, link).await;

        loop {
            let events = self.core.next_events().await;
            for event in events.iter() {
                self.handle(event, &mut device, config, link).await;
            }
        }
    }

    async fn bring_up<I2C, CE>(
        &self,
        device: &mut Bq25150<I2C, CE>,
        config: &ChargerConfig,
    ) -> Result<(), &'static str>
    where
        I2C: I2c,
        CE: OutputPin,
    {
        device.set_verify_writes(config.verify_writes);
        device
            .init()
            .map_err(|_| "Unable to drive the charge enable line")?;

        let deadline = Instant::now() + config.probe_window;
        loop {
            match device.probe().await {
                Ok(()) => break,
                Err(e) if Instant::now() >= deadline => {
                    warn!("charger: last probe error {:?}", e);
                    return Err("Unable to establish connection with charger");
                }
                Err(_) => Timer::after(config.probe_interval).await,
            }
        }

        self.irq_armed.store(true, Ordering::Release);

        if let InterruptMaskPolicy::Apply(masks) = config.mask_policy {
            device
                .apply_interrupt_masks(&masks)
                .await
                .map_err(|_| "Unable to configure charger interrupt masks")?;
        }

        let params = config.parameters;
        self.core.update(|b| b.params = params).await;

        device
            .set_charging_enabled(params.charging_enabled)
            .await
            .map_err(|_| "Unable to set charging state")?;
        device
            .set_input_current_limit(params.input_current_limit)
            .await
            .map_err(|_| "Unable to set input current limit")?;
        device
            .set_watchdog_enabled(params.watchdog_enabled)
            .await
            .map_err(|_| "Unable to configure watchdog")?;
        device
            .set_regulation_voltage(params.termination_voltage)
            .await
            .map_err(|_| "Unable to set termination voltage")?;
        device
            .set_termination_current(params.termination_current)
            .await
            .map_err(|_| "Unable to set termination current")?;
        device
            .set_charging_current(params.charging_current)
            .await
            .map_err(|_| "Unable to set charging current")?;

        report_configuration(device)
            .await
            .map_err(|_| "Unable to read back charger configuration")
    }

    async fn handle<I2C, CE>(
        &self,
        event: ChargerEvents,
        device: &mut Bq25150<I2C, CE>,
        config: &ChargerConfig,
        link: &dyn StatusLink,
    ) where
        I2C: I2c,
        CE: OutputPin,
    {
        if event == ChargerEvents::PROCESS_INTERRUPT {
            self.process_interrupt(device, config, link).await;
            return;
        }

        let (block, through) = self.core.snapshot(event).await;
        let params = block.params;

        let result = if event == ChargerEvents::SET_CHARGING_STATUS {
            device.set_charging_enabled(params.charging_enabled).await
        } else if event == ChargerEvents::SET_CHARGING_CURRENT {
            device.set_charging_current(params.charging_current).await
        } else if event == ChargerEvents::SET_TERM_CURRENT {
            device.set_termination_current(params.termination_current).await
        } else if event == ChargerEvents::SET_TERM_VOLTAGE {
            device.set_regulation_voltage(params.termination_voltage).await
        } else if event == ChargerEvents::SET_INPUT_CURRENT_LIMIT {
            device.set_input_current_limit(params.input_current_limit).await
        } else if event == ChargerEvents::SET_WATCHDOG {
            device.set_watchdog_enabled(params.watchdog_enabled).await
        } else if event == ChargerEvents::READ_REGISTER {
            match device.read_register(block.register_address).await {
                Ok(value) => {
                    self.core.update(|b| b.register_value = value).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            return;
        };

        self.finish(event, through, result);
    }

    fn finish(&self, event: ChargerEvents, through: u32, result: Result<(), ChargerError>) {
        match result {
            Ok(()) => debug!("charger: applied {:?}", event.bits()),
            Err(e) => error!("charger: request {:?} failed: {:?}", event.bits(), e),
        }
        self.core.complete(event, through, result.is_ok());
    }

    /// Read flags until the device reports none, acting on the events this layer owns.
    async fn process_interrupt<I2C, CE>(
        &self,
        device: &mut Bq25150<I2C, CE>,
        config: &ChargerConfig,
        link: &dyn StatusLink,
    ) where
        I2C: I2c,
        CE: OutputPin,
    {
        let mut seen = InterruptSnapshot::default();
        let mut read_any = false;

        for _ in 0..config.max_interrupt_passes {
            let mut snapshot = match device.read_interrupt_flags().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("charger: unable to read interrupt flags: {:?}", e);
                    break;
                }
            };
            read_any = true;
            if snapshot.is_empty() {
                break;
            }

            let flags = snapshot.charger();
            if flags.contains(ChargerFlags::CHARGE_DONE) {
                link.send(MessageKind::Action, CHARGE_DONE_MESSAGE);
                snapshot.clear(ChargerFlags::CHARGE_DONE);
            }
            if flags.contains(ChargerFlags::BAT_UVLO) {
                link.send(MessageKind::Action, UNDERVOLTAGE_MESSAGE);
                snapshot.clear(ChargerFlags::BAT_UVLO);
            }

            info!(
                "charger: flags charger={:#x} adc={:#x} timer={:#x}",
                snapshot.charger_flags, snapshot.adc_flags, snapshot.timer_flags
            );
            seen.merge(&snapshot);
        }

        if read_any {
            self.core.update(|b| b.interrupts = seen).await;
        }
    }
}

/// Read the applied configuration back from the device and log it.
async fn report_configuration<I2C, CE>(device: &mut Bq25150<I2C, CE>) -> Result<(), ChargerError>
where
    I2C: I2c,
    CE: OutputPin,
{
    let enabled = device.charging_enabled().await?;
    let limit = device.input_current_limit().await?;
    let volts = device.regulation_voltage().await?;
    let percent = device.termination_current().await?;
    let milliamps = device.charging_current().await?;
    info!(
        "charger: enabled={} ilim={}mA vbat={}V iterm={}% ichg={}mA",
        enabled,
        limit.milliamps(),
        volts,
        percent,
        milliamps
    );
    Ok(())
}

impl Default for ChargerService {
    fn default() -> Self {
        Self::new()
    }
}
