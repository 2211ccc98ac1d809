//! Board wiring: service singletons, their tasks and the platform the supervisor boots.

use embassy_executor::{SpawnError, Spawner};
use embassy_stm32::{exti::ExtiInput, gpio::Output, peripherals::TIM1, timer::simple_pwm::SimplePwmChannel};
use embassy_time::{Duration, Timer};

use crate::apps::charger::ChargerService;
use crate::apps::eez_dib::EezDibService;
use crate::apps::sstream::{AcquisitionListener, SampleStreamHub};
use crate::apps::status_link::StatusChannel;
use crate::apps::system::{BootCause, Platform, StatusIndicators, SystemService};
use crate::config::{self, SERVICE_START_TIMEOUT};
use crate::peripherals::{gpio, i2c::{self, ChargerDevice}, init_system, pwm, spi::EezSpiLink};
use crate::{claim_charger, claim_charger_irq, claim_eez_spi, claim_rgb, claim_status_leds, claim_user_button};

pub static CHARGER: ChargerService = ChargerService::new();
pub static EEZ_DIB: EezDibService = EezDibService::new();
pub static SUPERVISOR: SystemService = SystemService::new();
pub static SAMPLES: SampleStreamHub = SampleStreamHub::new();
pub static STATUS_LINK: StatusChannel<8> = StatusChannel::new();

pub type BoardIndicators = StatusIndicators<
    Output<'static>,
    Output<'static>,
    SimplePwmChannel<'static, TIM1>,
    SimplePwmChannel<'static, TIM1>,
    SimplePwmChannel<'static, TIM1>,
>;

#[embassy_executor::task]
async fn charger_task(device: ChargerDevice<'static>) -> ! {
    CHARGER.run(device, &config::CHARGER, &STATUS_LINK, &SUPERVISOR).await
}

#[embassy_executor::task]
async fn charger_irq_task(mut line: ExtiInput<'static>) -> ! {
    loop {
        line.wait_for_falling_edge().await;
        CHARGER.on_interrupt();
    }
}

#[embassy_executor::task]
async fn eez_dib_task() -> ! {
    EEZ_DIB.run(&SAMPLES, &SUPERVISOR).await
}

#[embassy_executor::task]
async fn eez_link_task(mut link: EezSpiLink<'static>) -> ! {
    EEZ_DIB.pump(&mut link).await
}

#[embassy_executor::task]
async fn supervisor_task(mut platform: BoardPlatform, mut indicators: BoardIndicators) -> ! {
    SUPERVISOR
        .run(&mut platform, &mut indicators, &EEZ_DIB, &config::SYSTEM)
        .await
}

/// Stand-in consumer of the status link until the network side drains it.
#[embassy_executor::task]
async fn status_link_task() -> ! {
    loop {
        let message = STATUS_LINK.receive().await;
        info!("status link {:?}: {}", message.kind, message.text.as_str());
    }
}

#[embassy_executor::task]
async fn user_button_task(mut button: ExtiInput<'static>) -> ! {
    loop {
        button.wait_for_rising_edge().await;
        info!("user button pressed");
    }
}

fn spawned(task: &str, result: Result<(), SpawnError>) {
    if result.is_err() {
        error!("board: unable to spawn {}", task);
    }
}

/// Bring-up steps the supervisor sequences on this board.
pub struct BoardPlatform {
    spawner: Spawner,
    button: Option<ExtiInput<'static>>,
}

impl Platform for BoardPlatform {
    async fn init_drivers(&mut self) -> Result<(), BootCause> {
        // Clocks and peripheral claims are settled before the supervisor runs
        Ok(())
    }

    async fn register_user_button(&mut self) -> Result<(), BootCause> {
        let button = self.button.take().ok_or(BootCause::Peripheral)?;
        self.spawner
            .spawn(user_button_task(button))
            .map_err(|_| BootCause::Peripheral)
    }

    async fn init_logging(&mut self) -> Result<(), BootCause> {
        info!("logging over RTT");
        Ok(())
    }

    async fn init_charger(&mut self) -> Result<(), BootCause> {
        CHARGER.start();
        CHARGER
            .wait_ready(SERVICE_START_TIMEOUT)
            .await
            .map_err(BootCause::Service)
    }

    async fn init_energy_debugger(&mut self) -> Result<(), BootCause> {
        Ok(())
    }

    async fn init_network(&mut self) -> Result<(), BootCause> {
        self.spawner
            .spawn(status_link_task())
            .map_err(|_| BootCause::Subsystem)
    }

    async fn init_control(&mut self) -> Result<(), BootCause> {
        Ok(())
    }

    async fn init_sample_stream(&mut self) -> Result<(), BootCause> {
        Ok(())
    }

    async fn init_discharge_control(&mut self) -> Result<(), BootCause> {
        Ok(())
    }

    async fn init_eez_dib(&mut self) -> Result<(), BootCause> {
        EEZ_DIB.start();
        EEZ_DIB
            .wait_ready(SERVICE_START_TIMEOUT)
            .await
            .map_err(BootCause::Service)
    }

    async fn register_acquisition_listener(
        &mut self,
        listener: &'static dyn AcquisitionListener,
    ) -> Result<(), BootCause> {
        SAMPLES
            .register_listener(listener)
            .map_err(|_| BootCause::Subsystem)
    }
}

/// Claim the board, spawn every worker and keep a heartbeat.
pub async fn run(spawner: Spawner) -> ! {
    info!("Starting daq firmware v{}", env!("CARGO_PKG_VERSION"));

    let p = init_system();

    let (link_led, error_led) = gpio::status_leds(claim_status_leds!(p));
    let rgb = pwm::rgb_pwm(claim_rgb!(p), &config::RGB_PWM);
    let indicators = StatusIndicators::new(link_led, error_led, rgb.red, rgb.green, rgb.blue);
    let platform = BoardPlatform {
        spawner,
        button: Some(gpio::user_button(claim_user_button!(p))),
    };

    info!("System initialized, spawning service workers...");

    spawned("charger", spawner.spawn(charger_task(i2c::charger_device(claim_charger!(p)))));
    spawned("charger irq", spawner.spawn(charger_irq_task(gpio::charger_irq(claim_charger_irq!(p)))));
    spawned("eez-dib", spawner.spawn(eez_dib_task()));
    spawned("eez-dib link", spawner.spawn(eez_link_task(EezSpiLink::new(claim_eez_spi!(p)))));
    spawned("supervisor", spawner.spawn(supervisor_task(platform, indicators)));

    loop {
        Timer::after(Duration::from_secs(60)).await;
        info!("System heartbeat: supervisor {:?}", SUPERVISOR.state());
    }
}
