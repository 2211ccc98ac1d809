//! BQ25150 linear battery charger driver
//!
//! Register-level access to the charger over I²C plus the external charge-enable line.
//! Every bus transaction carries its own timeout so a missing or wedged device surfaces
//! as [`ChargerError::Timeout`] instead of blocking the owning worker.

use embassy_time::{with_timeout, Duration};
use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::{Error as _, ErrorKind};
use embedded_hal_async::i2c::I2c;

use super::registers::*;

/// Upper bound for a single register transaction
const BUS_TIMEOUT: Duration = Duration::from_millis(50);

/// Charger driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerError {
    /// I²C transaction failed
    Bus(ErrorKind),
    /// I²C transaction did not finish within the bus timeout
    Timeout,
    /// Identity register did not hold the expected value
    WrongDevice(u8),
    /// Read-back after a verified write differed from the written value
    VerifyMismatch { register: u8, wrote: u8, read: u8 },
    /// The requested value has no register encoding
    OutOfRange,
    /// Charge-enable line could not be driven
    Pin,
}

/// BQ25150 driver over any async I²C bus and an output pin mirroring charge enable.
///
/// The charge-enable line is active low on the BQ25150 (`/CE`), so enabling charging
/// drives it low.
pub struct Bq25150<I2C, CE> {
    i2c: I2C,
    charge_enable: CE,
    verify_writes: bool,
}

impl<I2C, CE> Bq25150<I2C, CE>
where
    I2C: I2c,
    CE: OutputPin,
{
    pub fn new(i2c: I2C, charge_enable: CE) -> Self {
        Self {
            i2c,
            charge_enable,
            verify_writes: true,
        }
    }

    /// Enable or disable read-back verification of configuration writes.
    pub fn set_verify_writes(&mut self, verify: bool) {
        self.verify_writes = verify;
    }

    /// Put the external line into a known state: charging disabled.
    pub fn init(&mut self) -> Result<(), ChargerError> {
        self.charge_enable.set_high().map_err(|_| ChargerError::Pin)
    }

    /// Read a single register.
    pub async fn read_register(&mut self, reg: u8) -> Result<u8, ChargerError> {
        let mut buf = [0u8; 1];
        self.read_burst(reg, &mut buf).await?;
        Ok(buf[0])
    }

    /// Read consecutive registers starting at `reg`.
    pub async fn read_burst(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), ChargerError> {
        match with_timeout(BUS_TIMEOUT, self.i2c.write_read(I2C_ADDRESS, &[reg], buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChargerError::Bus(e.kind())),
            Err(_) => Err(ChargerError::Timeout),
        }
    }

    /// Write a single register, optionally reading it back to confirm.
    pub async fn write_register(&mut self, reg: u8, value: u8, verify: bool) -> Result<(), ChargerError> {
        match with_timeout(BUS_TIMEOUT, self.i2c.write(I2C_ADDRESS, &[reg, value])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ChargerError::Bus(e.kind())),
            Err(_) => return Err(ChargerError::Timeout),
        }

        if verify {
            let read = self.read_register(reg).await?;
            if read != value {
                return Err(ChargerError::VerifyMismatch {
                    register: reg,
                    wrote: value,
                    read,
                });
            }
        }
        Ok(())
    }

    /// Read-modify-write of the bits selected by `mask`.
    async fn modify_register(&mut self, reg: Register, mask: u8, bits: u8) -> Result<u8, ChargerError> {
        let current = self.read_register(reg.addr()).await?;
        let value = (current & !mask) | (bits & mask);
        self.write_register(reg.addr(), value, self.verify_writes).await?;
        Ok(value)
    }

    /// Read the identity register and check it against the BQ25150 ID.
    pub async fn probe(&mut self) -> Result<(), ChargerError> {
        let id = self.read_register(Register::DeviceId.addr()).await?;
        if id != DEVICE_ID {
            return Err(ChargerError::WrongDevice(id));
        }
        Ok(())
    }

    /// Switch charging on or off, mirroring the state on the charge-enable line.
    pub async fn set_charging_enabled(&mut self, enabled: bool) -> Result<(), ChargerError> {
        let disable = if enabled { 0 } else { ICCTRL2_CHARGE_DISABLE };
        self.modify_register(Register::IcCtrl2, ICCTRL2_CHARGE_DISABLE, disable)
            .await?;

        let line = if enabled {
            self.charge_enable.set_low()
        } else {
            self.charge_enable.set_high()
        };
        line.map_err(|_| ChargerError::Pin)
    }

    pub async fn charging_enabled(&mut self) -> Result<bool, ChargerError> {
        let value = self.read_register(Register::IcCtrl2.addr()).await?;
        Ok(value & ICCTRL2_CHARGE_DISABLE == 0)
    }

    pub async fn set_input_current_limit(&mut self, limit: InputCurrentLimit) -> Result<(), ChargerError> {
        self.modify_register(Register::IlimCtrl, ILIMCTRL_ILIM_MASK, limit as u8)
            .await
            .map(|_| ())
    }

    pub async fn input_current_limit(&mut self) -> Result<InputCurrentLimit, ChargerError> {
        let value = self.read_register(Register::IlimCtrl.addr()).await?;
        Ok(InputCurrentLimit::from_field(value))
    }

    pub async fn set_watchdog_enabled(&mut self, enabled: bool) -> Result<(), ChargerError> {
        let disable = if enabled { 0 } else { CHARGERCTRL0_WATCHDOG_DISABLE };
        self.modify_register(Register::ChargerCtrl0, CHARGERCTRL0_WATCHDOG_DISABLE, disable)
            .await
            .map(|_| ())
    }

    /// Battery regulation (termination) voltage in volts.
    pub async fn set_regulation_voltage(&mut self, volts: f32) -> Result<(), ChargerError> {
        let code = regulation_voltage_code(volts).ok_or(ChargerError::OutOfRange)?;
        self.write_register(Register::VbatCtrl.addr(), code, self.verify_writes)
            .await
    }

    pub async fn regulation_voltage(&mut self) -> Result<f32, ChargerError> {
        let code = self.read_register(Register::VbatCtrl.addr()).await?;
        Ok(regulation_voltage_from_code(code))
    }

    /// Termination current in percent of the charging current.
    pub async fn set_termination_current(&mut self, percent: u8) -> Result<(), ChargerError> {
        let current = self.read_register(Register::TermCtrl.addr()).await?;
        let control = termination_control(current, percent).ok_or(ChargerError::OutOfRange)?;
        self.write_register(Register::TermCtrl.addr(), control, self.verify_writes)
            .await
    }

    pub async fn termination_current(&mut self) -> Result<u8, ChargerError> {
        let control = self.read_register(Register::TermCtrl.addr()).await?;
        Ok(termination_current_from_control(control))
    }

    /// Fast-charge current in mA.
    pub async fn set_charging_current(&mut self, milliamps: u16) -> Result<(), ChargerError> {
        let code = charging_current_code(milliamps).ok_or(ChargerError::OutOfRange)?;
        self.write_register(Register::IchgCtrl.addr(), code, self.verify_writes)
            .await
    }

    pub async fn charging_current(&mut self) -> Result<f32, ChargerError> {
        let code = self.read_register(Register::IchgCtrl.addr()).await?;
        Ok(charging_current_from_code(code))
    }

    /// Program MASK0..MASK3.
    pub async fn apply_interrupt_masks(&mut self, masks: &InterruptMasks) -> Result<(), ChargerError> {
        let [low, high] = masks.charger.to_le_bytes();
        self.write_register(Register::Mask0.addr(), low, self.verify_writes).await?;
        self.write_register(Register::Mask1.addr(), high, self.verify_writes).await?;
        self.write_register(Register::Mask2.addr(), masks.adc, self.verify_writes).await?;
        self.write_register(Register::Mask3.addr(), masks.timer, self.verify_writes)
            .await
    }

    /// Fetch charger, ADC and timer flags. The device clears them on read.
    pub async fn read_interrupt_flags(&mut self) -> Result<InterruptSnapshot, ChargerError> {
        let mut charger = [0u8; 2];
        self.read_burst(Register::Flag0.addr(), &mut charger).await?;
        let adc_flags = self.read_register(Register::Flag2.addr()).await?;
        let timer_flags = self.read_register(Register::Flag3.addr()).await?;

        Ok(InterruptSnapshot {
            charger_flags: u16::from_le_bytes(charger),
            adc_flags,
            timer_flags,
        })
    }
}
