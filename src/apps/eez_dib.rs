//! EEZ-DIB bridge service.
//!
//! The companion board clocks fixed 10-byte frames over SPI with this board as slave.
//! A received frame is complete when byte 5 holds the carriage-return sentinel; complete
//! frames go through a bounded queue to the worker, which answers by rebuilding the
//! transmit frame from the latest sample of the bound stream.
//!
//! Transmit frame layout:
//!
//! | byte | content                                                       |
//! |------|---------------------------------------------------------------|
//! | 0..4 | sample bytes 9, 8, 1, 0 while active, else `AA BB CC DD`      |
//! | 4    | bit 0 set while acquisition is active                         |
//! | 5..7 | `A5 A5`                                                       |
//! | 7..10| unused, zero                                                  |
//!
//! Worker event order within one wake: `FRAME_RECEIVED`, `RX_OVERFLOW`, `TX_REFRESH`.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex as BlockingMutex},
    channel::Channel,
};
use embassy_time::{Duration, Timer};

use crate::apps::sstream::{SampleSource, StreamAcquisition, StreamId, MAX_SAMPLE_LEN};
use crate::peripherals::FrameTransport;
use crate::service::{ErrorSink, ServiceCore, ServiceError, ServiceState};

pub const FRAME_LEN: usize = 10;
pub type Frame = [u8; FRAME_LEN];

/// RX byte that marks a complete frame
pub const FRAME_SENTINEL: u8 = 0x0D;
pub const FRAME_SENTINEL_INDEX: usize = 5;

/// Frames the ISR may queue before the worker drains them
pub const RX_QUEUE_DEPTH: usize = 4;

/// TX byte 4, bit 0: acquisition running
pub const ACQUISITION_FLAG: u8 = 1 << 0;

/// Transmit frame while no sample is forwarded
pub const IDLE_FRAME: Frame = [0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0xA5, 0xA5, 0x00, 0x00, 0x00];

/// Shortest raw sample that carries the forwarded bytes
const MIN_SAMPLE_LEN: usize = 10;

/// Back-off after a failed exchange
const TRANSPORT_RETRY: Duration = Duration::from_millis(10);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EezEvents: u32 {
        const FRAME_RECEIVED = 1 << 0;
        const RX_OVERFLOW = 1 << 1;
        const TX_REFRESH = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Acquisition {
    Undefined,
    Inactive,
    Active,
}

impl From<StreamAcquisition> for Acquisition {
    fn from(state: StreamAcquisition) -> Self {
        match state {
            StreamAcquisition::Active => Acquisition::Active,
            StreamAcquisition::Inactive => Acquisition::Inactive,
            StreamAcquisition::Transitional => Acquisition::Undefined,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EezBlock {
    acquisition: Acquisition,
    stream: Option<StreamId>,
}

/// Build the transmit frame for an acquisition state and the latest raw sample.
///
/// While active without a usable sample the placeholder bytes are sent with the
/// acquisition flag set.
pub fn build_tx_frame(acquisition: Acquisition, sample: Option<&[u8]>) -> Frame {
    let mut frame = IDLE_FRAME;
    if acquisition == Acquisition::Active {
        if let Some(s) = sample.filter(|s| s.len() >= MIN_SAMPLE_LEN) {
            frame[..4].copy_from_slice(&[s[9], s[8], s[1], s[0]]);
        }
        frame[4] |= ACQUISITION_FLAG;
    }
    frame
}

pub struct EezDibService {
    core: ServiceCore<EezBlock, EezEvents>,
    rx_queue: Channel<CriticalSectionRawMutex, Frame, RX_QUEUE_DEPTH>,
    tx_frame: BlockingMutex<CriticalSectionRawMutex, Cell<Frame>>,
    frames: AtomicU32,
    ignored: AtomicU32,
}

impl EezDibService {
    pub const fn new() -> Self {
        Self {
            core: ServiceCore::new(
                "eez-dib",
                EezBlock {
                    acquisition: Acquisition::Undefined,
                    stream: None,
                },
            ),
            rx_queue: Channel::new(),
            tx_frame: BlockingMutex::new(Cell::new(IDLE_FRAME)),
            frames: AtomicU32::new(0),
            ignored: AtomicU32::new(0),
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

    /// Bind the forwarded stream and its acquisition state. Returns once the transmit
    /// frame reflects the new state.
    pub async fn set_acquisition_state(
        &self,
        acquisition: Acquisition,
        stream: Option<StreamId>,
        timeout: Duration,
    ) -> Result<(), ServiceError> {
        self.core
            .request(EezEvents::TX_REFRESH, timeout, |b| {
                b.acquisition = acquisition;
                b.stream = stream;
            })
            .await
    }

    pub async fn acquisition_state(
        &self,
        timeout: Duration,
    ) -> Result<(Acquisition, Option<StreamId>), ServiceError> {
        self.core.read(timeout, |b| (b.acquisition, b.stream)).await
    }

    /// Frame armed for the next exchange.
    pub fn tx_frame(&self) -> Frame {
        self.tx_frame.lock(|frame| frame.get())
    }

    /// Complete frames accepted since boot.
    pub fn frames_received(&self) -> u32 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Frames dropped for a missing sentinel or because the service was not serving.
    pub fn frames_ignored(&self) -> u32 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Receive-complete handler of the SPI link. Interrupt safe.
    pub fn on_frame_received(&self, rx: &Frame) {
        if rx[FRAME_SENTINEL_INDEX] != FRAME_SENTINEL || self.core.state() != ServiceState::Service {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.rx_queue.try_send(*rx) {
            Ok(()) => self.core.notify_from_isr(EezEvents::FRAME_RECEIVED),
            Err(_) => self.core.notify_from_isr(EezEvents::RX_OVERFLOW),
        }
    }

    /// Drive the link: keep the current transmit frame armed and hand every received
    /// frame to [`on_frame_received`](Self::on_frame_received).
    pub async fn pump<T: FrameTransport>(&self, transport: &mut T) -> ! {
        let mut rx: Frame = [0; FRAME_LEN];
        loop {
            let tx = self.tx_frame();
            match transport.exchange(&tx, &mut rx).await {
                Ok(()) => self.on_frame_received(&rx),
                Err(_) => {
                    warn!("eez-dib: frame exchange failed");
                    Timer::after(TRANSPORT_RETRY).await;
                }
            }
        }
    }

    /// Bridge worker.
    pub async fn run<S: SampleSource>(&self, samples: &S, errors: &dyn ErrorSink) -> ! {
        self.core.wait_started().await;
        self.core.enter_service();
        self.refresh_tx(samples).await;

        loop {
            let events = self.core.next_events().await;

            if events.contains(EezEvents::FRAME_RECEIVED) {
                while let Ok(frame) = self.rx_queue.try_receive() {
                    let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("eez-dib: frame {} cmd {:#x}", count, frame[0]);
                }
            }
            if events.contains(EezEvents::RX_OVERFLOW) {
                self.core.fail(errors, "RX frame queue overflow").await
            }
            // Every received frame is answered with a fresh transmit frame
            if events.intersects(EezEvents::FRAME_RECEIVED | EezEvents::TX_REFRESH) {
                self.refresh_tx(samples).await;
            }
        }
    }

    async fn refresh_tx<S: SampleSource>(&self, samples: &S) {
        let (block, through) = self.core.snapshot(EezEvents::TX_REFRESH).await;

        let mut raw = [0u8; MAX_SAMPLE_LEN];
        let sample = match (block.acquisition, block.stream) {
            (Acquisition::Active, Some(stream)) => samples
                .last_sample(stream, &mut raw)
                .map(|len| &raw[..len]),
            _ => None,
        };

        let frame = build_tx_frame(block.acquisition, sample);
        self.tx_frame.lock(|tx| tx.set(frame));
        self.core.complete(EezEvents::TX_REFRESH, through, true);
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self, event: EezEvents) -> u32 {
        self.core.outstanding(event)
    }
}

impl Default for EezDibService {
    fn default() -> Self {
        Self::new()
    }
}
