//! Host-side fakes shared by the unit tests.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use embassy_futures::yield_now;
use embassy_time::{Duration, Timer};
use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
use embedded_hal_async::i2c::{I2c, Operation};

use crate::apps::charger::ChargerService;
use crate::apps::eez_dib::{Frame, FRAME_LEN};
use crate::apps::sstream::AcquisitionListener;
use crate::apps::system::{BootCause, BootStep, Platform};
use crate::config::SERVICE_START_TIMEOUT;
use crate::drivers::bq25150::registers::{DEVICE_ID, I2C_ADDRESS};
use crate::drivers::bq25150::registers::Register;
use crate::drivers::bq25150::ChargerFlags;
use crate::peripherals::FrameTransport;
use crate::service::{ErrorLevel, ErrorSink};

/// Give a value the `'static` lifetime services and listeners need.
pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// Let fire-and-forget work reach its worker.
pub async fn settle() {
    Timer::after(Duration::from_millis(5)).await;
}

// ---- BQ25150 register file -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeBusError;

impl embedded_hal::i2c::Error for FakeBusError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)
    }
}

struct RegisterFile {
    present: bool,
    latency: Duration,
    pointer: u8,
    registers: [u8; 256],
    stuck: [bool; 256],
    /// Charger flags latched right after the next FLAG3 read
    relatch: u16,
}

impl RegisterFile {
    fn clears_on_read(address: u8) -> bool {
        (Register::Flag0.addr()..=Register::Flag3.addr()).contains(&address)
    }

    fn read(&mut self) -> u8 {
        let address = self.pointer;
        let value = self.registers[address as usize];
        if Self::clears_on_read(address) {
            self.registers[address as usize] = 0;
        }
        if address == Register::Flag3.addr() && self.relatch != 0 {
            let [low, high] = self.relatch.to_le_bytes();
            self.registers[Register::Flag0.addr() as usize] |= low;
            self.registers[Register::Flag1.addr() as usize] |= high;
            self.relatch = 0;
        }
        self.pointer = address.wrapping_add(1);
        value
    }

    fn write(&mut self, value: u8) {
        let address = self.pointer as usize;
        if !self.stuck[address] {
            self.registers[address] = value;
        }
        self.pointer = self.pointer.wrapping_add(1);
    }
}

/// BQ25150 stand-in on a fake I²C bus. Clones share the same register file.
#[derive(Clone)]
pub struct FakeCharger {
    state: Arc<Mutex<RegisterFile>>,
}

impl FakeCharger {
    pub fn new() -> Self {
        let mut registers = [0u8; 256];
        registers[Register::DeviceId.addr() as usize] = DEVICE_ID;
        Self {
            state: Arc::new(Mutex::new(RegisterFile {
                present: true,
                latency: Duration::from_ticks(0),
                pointer: 0,
                registers,
                stuck: [false; 256],
                relatch: 0,
            })),
        }
    }

    /// A charger that never acknowledges its address.
    pub fn absent() -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().present = false;
        fake
    }

    /// Stop (or resume) acknowledging the bus address.
    pub fn set_present(&self, present: bool) {
        self.state.lock().unwrap().present = present;
    }

    /// Delay every bus transaction by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    pub fn register(&self, address: u8) -> u8 {
        self.state.lock().unwrap().registers[address as usize]
    }

    pub fn set_register(&self, address: u8, value: u8) {
        self.state.lock().unwrap().registers[address as usize] = value;
    }

    /// Pin a register to `value`; bus writes to it are ignored from now on.
    pub fn stick_register(&self, address: u8, value: u8) {
        let mut state = self.state.lock().unwrap();
        state.registers[address as usize] = value;
        state.stuck[address as usize] = true;
    }

    /// Latch flags as the device would before asserting its interrupt line.
    pub fn raise_flags(&self, charger: ChargerFlags, adc: u8, timer: u8) {
        let [low, high] = charger.bits().to_le_bytes();
        let mut state = self.state.lock().unwrap();
        state.registers[Register::Flag0.addr() as usize] |= low;
        state.registers[Register::Flag1.addr() as usize] |= high;
        state.registers[Register::Flag2.addr() as usize] |= adc;
        state.registers[Register::Flag3.addr() as usize] |= timer;
    }

    /// Latch `charger` flags just after the worker finishes its next flag read, as an
    /// event arriving while the previous one is being serviced.
    pub fn latch_after_flag_read(&self, charger: ChargerFlags) {
        self.state.lock().unwrap().relatch |= charger.bits();
    }
}

impl embedded_hal_async::i2c::ErrorType for FakeCharger {
    type Error = FakeBusError;
}

impl I2c for FakeCharger {
    async fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        let latency = self.state.lock().unwrap().latency;
        if latency.as_ticks() > 0 {
            Timer::after(latency).await;
        }
        let mut state = self.state.lock().unwrap();
        if !state.present || address != I2C_ADDRESS {
            return Err(FakeBusError);
        }
        for operation in operations {
            match operation {
                Operation::Write(bytes) => {
                    if let Some((&register, data)) = bytes.split_first() {
                        state.pointer = register;
                        for &value in data {
                            state.write(value);
                        }
                    }
                }
                Operation::Read(buffer) => {
                    for byte in buffer.iter_mut() {
                        *byte = state.read();
                    }
                }
            }
        }
        Ok(())
    }
}

// ---- GPIO and PWM ----------------------------------------------------------------------

/// Output pin remembering its level. Clones observe the same line.
#[derive(Clone, Default)]
pub struct RecordingPin {
    high: Arc<AtomicBool>,
}

impl RecordingPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_high(&self) -> bool {
        self.high.load(Ordering::SeqCst)
    }
}

impl embedded_hal::digital::ErrorType for RecordingPin {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for RecordingPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// PWM channel remembering its duty cycle.
#[derive(Clone)]
pub struct RecordingPwm {
    max: u16,
    duty: Arc<AtomicU16>,
}

impl RecordingPwm {
    pub fn new(max: u16) -> Self {
        Self {
            max,
            duty: Arc::new(AtomicU16::new(0)),
        }
    }

    pub fn duty(&self) -> u16 {
        self.duty.load(Ordering::SeqCst)
    }
}

impl embedded_hal::pwm::ErrorType for RecordingPwm {
    type Error = Infallible;
}

impl embedded_hal::pwm::SetDutyCycle for RecordingPwm {
    fn max_duty_cycle(&self) -> u16 {
        self.max
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Self::Error> {
        self.duty.store(duty, Ordering::SeqCst);
        Ok(())
    }
}

// ---- Error sink ------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<ErrorLevel>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorLevel> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingSink {
    fn report_error(&self, level: ErrorLevel) {
        self.reports.lock().unwrap().push(level);
    }
}

// ---- EEZ-DIB link ----------------------------------------------------------------------

struct Script {
    incoming: VecDeque<Frame>,
    sent: Vec<Frame>,
}

/// Peer that clocks a fixed list of frames and then goes quiet. Clones share the script.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new(frames: &[Frame]) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                incoming: frames.iter().copied().collect(),
                sent: Vec::new(),
            })),
        }
    }

    /// Frames this board transmitted, one per exchange.
    pub fn sent(&self) -> Vec<Frame> {
        self.script.lock().unwrap().sent.clone()
    }

    pub async fn wait_drained(&self) {
        while !self.script.lock().unwrap().incoming.is_empty() {
            yield_now().await;
        }
    }
}

impl FrameTransport for ScriptedTransport {
    type Error = Infallible;

    async fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Self::Error> {
        let next = {
            let mut script = self.script.lock().unwrap();
            let next = script.incoming.pop_front();
            if next.is_some() {
                let mut sent = [0u8; FRAME_LEN];
                sent.copy_from_slice(tx);
                script.sent.push(sent);
            }
            next
        };
        match next {
            Some(frame) => {
                rx.copy_from_slice(&frame);
                Ok(())
            }
            None => core::future::pending().await,
        }
    }
}

// ---- Platform --------------------------------------------------------------------------

/// Platform whose steps all succeed except an optional failing one.
pub struct MockPlatform {
    steps: Vec<BootStep>,
    fail_at: Option<BootStep>,
    charger: Option<&'static ChargerService>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            fail_at: None,
            charger: None,
        }
    }

    pub fn failing_at(step: BootStep) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::new()
        }
    }

    /// Start this charger service during the charger step.
    pub fn with_charger(mut self, charger: &'static ChargerService) -> Self {
        self.charger = Some(charger);
        self
    }

    pub fn steps(&self) -> Vec<BootStep> {
        self.steps.clone()
    }

    fn record(&mut self, step: BootStep) -> Result<(), BootCause> {
        self.steps.push(step);
        if self.fail_at == Some(step) {
            return Err(BootCause::Subsystem);
        }
        Ok(())
    }
}

impl Platform for MockPlatform {
    async fn init_drivers(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::Drivers)
    }

    async fn register_user_button(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::UserButton)
    }

    async fn init_logging(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::Logging)
    }

    async fn init_charger(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::Charger)?;
        match self.charger {
            Some(charger) => {
                charger.start();
                charger
                    .wait_ready(SERVICE_START_TIMEOUT)
                    .await
                    .map_err(BootCause::Service)
            }
            None => Ok(()),
        }
    }

    async fn init_energy_debugger(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::EnergyDebugger)
    }

    async fn init_network(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::Network)
    }

    async fn init_control(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::Control)
    }

    async fn init_sample_stream(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::SampleStream)
    }

    async fn init_discharge_control(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::DischargeControl)
    }

    async fn init_eez_dib(&mut self) -> Result<(), BootCause> {
        self.record(BootStep::EezDib)
    }

    async fn register_acquisition_listener(
        &mut self,
        _listener: &'static dyn AcquisitionListener,
    ) -> Result<(), BootCause> {
        self.record(BootStep::AcquisitionListener)
    }
}
