//! BQ25150 register addresses, flag layouts and unit conversions.
//!
//! Only the registers the charger service drives are listed; the rest of the map stays
//! at its power-on defaults.

use bitflags::bitflags;

/// 7-bit I²C address of the charger
pub const I2C_ADDRESS: u8 = 0x6B;

/// Value of [`Register::DeviceId`] on a BQ25150
pub const DEVICE_ID: u8 = 0x20;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Register {
    Flag0 = 0x03,
    Flag1 = 0x04,
    Flag2 = 0x05,
    Flag3 = 0x06,
    Mask0 = 0x07,
    Mask1 = 0x08,
    Mask2 = 0x09,
    Mask3 = 0x0A,
    VbatCtrl = 0x12,
    IchgCtrl = 0x13,
    TermCtrl = 0x15,
    ChargerCtrl0 = 0x17,
    IlimCtrl = 0x19,
    IcCtrl2 = 0x37,
    DeviceId = 0x6F,
}

impl Register {
    pub const fn addr(self) -> u8 {
        self as u8
    }
}

/// CHARGERCTRL0: watchdog disable
pub const CHARGERCTRL0_WATCHDOG_DISABLE: u8 = 1 << 4;
/// ICCTRL2: charge disable
pub const ICCTRL2_CHARGE_DISABLE: u8 = 1 << 0;
/// TERMCTRL: termination current field, bits [6:1]
pub const TERMCTRL_ITERM_MASK: u8 = 0b0111_1110;
/// ILIMCTRL: input current limit field, bits [2:0]
pub const ILIMCTRL_ILIM_MASK: u8 = 0b0000_0111;

bitflags! {
    /// Charger event flags. FLAG0 is the low byte, FLAG1 the high byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChargerFlags: u16 {
        const VIN_PGOOD = 0x0001;
        const THERMREG = 0x0002;
        const VINDPM = 0x0004;
        const VDPPM = 0x0008;
        const IINLIM = 0x0010;
        const CHARGE_DONE = 0x0020;
        const CHRG_CV = 0x0040;
        const TS_HOT = 0x0100;
        const TS_WARM = 0x0200;
        const TS_COOL = 0x0400;
        const TS_COLD = 0x0800;
        const BAT_UVLO = 0x1000;
        const BAT_OCP = 0x2000;
        const VIN_OVP = 0x8000;
    }
}

/// Snapshot of the flag registers taken while servicing the interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterruptSnapshot {
    pub charger_flags: u16,
    pub adc_flags: u8,
    pub timer_flags: u8,
}

impl InterruptSnapshot {
    pub fn charger(&self) -> ChargerFlags {
        ChargerFlags::from_bits_retain(self.charger_flags)
    }

    pub fn is_empty(&self) -> bool {
        self.charger_flags == 0 && self.adc_flags == 0 && self.timer_flags == 0
    }

    /// Clear `flags` in the local copy only; the device clears its flags on read.
    pub fn clear(&mut self, flags: ChargerFlags) {
        self.charger_flags &= !flags.bits();
    }

    pub fn merge(&mut self, other: &InterruptSnapshot) {
        self.charger_flags |= other.charger_flags;
        self.adc_flags |= other.adc_flags;
        self.timer_flags |= other.timer_flags;
    }
}

/// Mask register values. A set bit masks the matching flag from the interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterruptMasks {
    /// MASK0 (low byte) and MASK1 (high byte), same layout as [`ChargerFlags`]
    pub charger: u16,
    /// MASK2
    pub adc: u8,
    /// MASK3
    pub timer: u8,
}

impl InterruptMasks {
    /// Unmask only the events the charger service acts on.
    pub const fn service_events() -> Self {
        Self {
            charger: !(ChargerFlags::CHARGE_DONE.bits() | ChargerFlags::BAT_UVLO.bits()),
            adc: 0xFF,
            timer: 0xFF,
        }
    }
}

/// Input current limit selections supported by ILIMCTRL.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InputCurrentLimit {
    Ma50 = 0,
    Ma100 = 1,
    Ma150 = 2,
    Ma200 = 3,
    Ma300 = 4,
    Ma400 = 5,
    Ma500 = 6,
    Ma600 = 7,
}

impl InputCurrentLimit {
    pub const fn milliamps(self) -> u16 {
        match self {
            InputCurrentLimit::Ma50 => 50,
            InputCurrentLimit::Ma100 => 100,
            InputCurrentLimit::Ma150 => 150,
            InputCurrentLimit::Ma200 => 200,
            InputCurrentLimit::Ma300 => 300,
            InputCurrentLimit::Ma400 => 400,
            InputCurrentLimit::Ma500 => 500,
            InputCurrentLimit::Ma600 => 600,
        }
    }

    pub fn from_field(field: u8) -> Self {
        match field & ILIMCTRL_ILIM_MASK {
            0 => InputCurrentLimit::Ma50,
            1 => InputCurrentLimit::Ma100,
            2 => InputCurrentLimit::Ma150,
            3 => InputCurrentLimit::Ma200,
            4 => InputCurrentLimit::Ma300,
            5 => InputCurrentLimit::Ma400,
            6 => InputCurrentLimit::Ma500,
            _ => InputCurrentLimit::Ma600,
        }
    }
}

/// Charging current LSB in mA
pub const ICHG_LSB_MA: f32 = 1.25;
/// Regulation voltage offset and LSB in volts
pub const VBAT_REG_BASE_V: f32 = 3.6;
pub const VBAT_REG_LSB_V: f32 = 0.01;
/// Highest VBAT_CTRL code (4.6 V)
pub const VBAT_REG_MAX_CODE: u8 = 100;
/// Widest value the TERMCTRL field holds
pub const ITERM_MAX_PERCENT: u8 = 0x3F;

/// Round a non-negative value to the nearest integer.
fn round_non_negative(value: f32) -> u32 {
    (value + 0.5) as u32
}

/// ICHG_CTRL code for a charging current, `round(mA / 1.25)`.
pub fn charging_current_code(milliamps: u16) -> Option<u8> {
    let code = round_non_negative(f32::from(milliamps) / ICHG_LSB_MA);
    u8::try_from(code).ok()
}

pub fn charging_current_from_code(code: u8) -> f32 {
    f32::from(code) * ICHG_LSB_MA
}

/// VBAT_CTRL code for a regulation voltage, `round((V - 3.6) / 0.01)`.
pub fn regulation_voltage_code(volts: f32) -> Option<u8> {
    let steps = (volts - VBAT_REG_BASE_V) / VBAT_REG_LSB_V;
    // Allow float noise just below 3.6 V to round to code 0
    if !(steps > -0.5) {
        return None;
    }
    let code = round_non_negative(steps.max(0.0));
    (code <= u32::from(VBAT_REG_MAX_CODE)).then_some(code as u8)
}

pub fn regulation_voltage_from_code(code: u8) -> f32 {
    VBAT_REG_BASE_V + f32::from(code) * VBAT_REG_LSB_V
}

/// TERMCTRL value with the termination current field replaced; bits 7 and 0 are kept.
pub fn termination_control(current: u8, percent: u8) -> Option<u8> {
    (percent <= ITERM_MAX_PERCENT).then(|| (current & !TERMCTRL_ITERM_MASK) | (percent << 1))
}

pub fn termination_current_from_control(control: u8) -> u8 {
    (control & TERMCTRL_ITERM_MASK) >> 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charging_current_rounds_to_register_lsb() {
        assert_eq!(charging_current_code(5), Some(4));
        assert_eq!(charging_current_code(50), Some(40));
        assert_eq!(charging_current_code(100), Some(80));
        assert_eq!(charging_current_code(300), Some(240));
        assert_eq!(charging_current_code(318), Some(254));
        assert_eq!(charging_current_code(400), None);
        assert_eq!(charging_current_from_code(80), 100.0);
    }

    #[test]
    fn regulation_voltage_codes() {
        assert_eq!(regulation_voltage_code(3.60), Some(0));
        assert_eq!(regulation_voltage_code(4.00), Some(40));
        assert_eq!(regulation_voltage_code(4.35), Some(75));
        assert_eq!(regulation_voltage_code(3.5), None);
        assert_eq!(regulation_voltage_code(4.7), None);
        assert!((regulation_voltage_from_code(75) - 4.35).abs() < 0.01);
    }

    #[test]
    fn termination_field_preserves_outer_bits() {
        assert_eq!(termination_control(0b1000_0001, 5), Some(0b1000_1011));
        assert_eq!(termination_control(0xFF, 0), Some(0b1000_0001));
        assert_eq!(termination_control(0, 64), None);
        assert_eq!(termination_current_from_control(0b1000_1011), 5);
    }

    #[test]
    fn input_limit_codes_follow_datasheet_order() {
        assert_eq!(InputCurrentLimit::Ma200 as u8, 3);
        assert_eq!(InputCurrentLimit::Ma200.milliamps(), 200);
        assert_eq!(InputCurrentLimit::from_field(0b1111_1111), InputCurrentLimit::Ma600);
        assert_eq!(InputCurrentLimit::from_field(0b0000_1110), InputCurrentLimit::Ma500);
    }

    #[test]
    fn snapshot_clear_is_local() {
        let mut snapshot = InterruptSnapshot {
            charger_flags: (ChargerFlags::CHARGE_DONE | ChargerFlags::VIN_PGOOD).bits(),
            adc_flags: 0,
            timer_flags: 0,
        };
        snapshot.clear(ChargerFlags::CHARGE_DONE);
        assert_eq!(snapshot.charger(), ChargerFlags::VIN_PGOOD);
        assert!(!snapshot.is_empty());
    }
}
