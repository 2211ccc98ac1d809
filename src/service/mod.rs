//! Service runtime shared by every firmware service.
//!
//! A service is a process-wide singleton made of a parameter block behind an async
//! mutex (the *guard*), a notification word drained by a dedicated worker, a completion
//! ledger that releases blocked callers, and a lifecycle state. External callers never
//! touch hardware: they write parameters, notify the worker and wait for their request
//! to complete. All device I/O happens on the worker.
//!
//! ```text
//!   caller ── lock guard ── write ── unlock ── notify(bit) ── wait(ticket)
//!                                                   │               ▲
//!   ISR ───────────────────────── notify_from_isr ──┤               │
//!                                                   ▼               │
//!   worker ── wait bits ── snapshot under guard ── device op ── complete
//! ```

pub mod completion;
pub mod notify;

use core::cell::RefCell;
use core::future::{pending, poll_fn};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU8, Ordering};
use core::task::Poll;

use bitflags::Flags;
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex as BlockingMutex},
    mutex::{Mutex, MutexGuard},
    signal::Signal,
    waitqueue::MultiWakerRegistration,
};
use embassy_time::{with_deadline, Duration, Instant};

pub use completion::{Completions, Outcome, Ticket};
pub use notify::Notifier;

/// Lifecycle of a service worker. `Error` is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceState {
    Init = 0,
    Service = 1,
    Error = 2,
}

impl ServiceState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ServiceState::Init,
            1 => ServiceState::Service,
            _ => ServiceState::Error,
        }
    }
}

/// Errors returned across a service API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServiceError {
    /// The guard or the completion was not obtained within the caller's timeout
    Timeout,
    /// The worker has not finished initialization yet
    NotReady,
    /// The service is in its terminal error state
    Failed,
    /// The worker ran the request but the device operation failed
    Device,
    /// The requested value cannot be represented by the device
    InvalidArgument,
}

/// Severity attached to a central error report.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorLevel {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl ErrorLevel {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ErrorLevel::Low),
            2 => Some(ErrorLevel::Medium),
            3 => Some(ErrorLevel::High),
            _ => None,
        }
    }
}

/// Central error sink. Implementations must not block: workers report from their own
/// context and the sink may itself still be booting.
pub trait ErrorSink {
    fn report_error(&self, level: ErrorLevel);
}

/// Tasks that can wait for one service to leave `Init` at the same time.
const MAX_READY_WAITERS: usize = 4;

/// Reusable skeleton of a service: guard, notification word, completions and state.
///
/// `P` is the parameter block, `E` the service's notification vocabulary. Every bit of
/// `E` maps to one completion slot.
pub struct ServiceCore<P, E> {
    name: &'static str,
    state: AtomicU8,
    started: Signal<CriticalSectionRawMutex, ()>,
    /// Tasks parked in `wait_ready`; state changes out of `Init` happen under this lock
    ready: BlockingMutex<CriticalSectionRawMutex, RefCell<MultiWakerRegistration<MAX_READY_WAITERS>>>,
    guard: Mutex<CriticalSectionRawMutex, P>,
    notifier: Notifier,
    completions: Completions,
    _events: PhantomData<fn() -> E>,
}

impl<P, E> ServiceCore<P, E>
where
    E: Flags<Bits = u32> + Copy,
{
    pub const fn new(name: &'static str, params: P) -> Self {
        Self {
            name,
            state: AtomicU8::new(ServiceState::Init as u8),
            started: Signal::new(),
            ready: BlockingMutex::new(RefCell::new(MultiWakerRegistration::new())),
            guard: Mutex::new(params),
            notifier: Notifier::new(),
            completions: Completions::new(),
            _events: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Leave `Init` and release every task waiting in [`wait_ready`](Self::wait_ready).
    fn release(&self, state: ServiceState) {
        self.ready.lock(|waiters| {
            self.state.store(state as u8, Ordering::Release);
            waiters.borrow_mut().wake();
        });
    }

    fn slot(event: E) -> usize {
        debug_assert!(event.bits().count_ones() == 1, "one completion slot per event");
        event.bits().trailing_zeros() as usize
    }

    // ---- caller side -------------------------------------------------------------

    /// Release the worker from its dormant state so it starts initialization.
    pub fn start(&self) {
        self.started.signal(());
    }

    /// Wait for the worker to leave `Init`. Any number of tasks may wait at once.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ServiceError> {
        let left_init = poll_fn(|cx| {
            self.ready.lock(|waiters| match self.state() {
                ServiceState::Init => {
                    waiters.borrow_mut().register(cx.waker());
                    Poll::Pending
                }
                state => Poll::Ready(state),
            })
        });
        let outcome = with_deadline(Instant::now() + timeout, left_init)
            .await
            .map_err(|_| ServiceError::Timeout)?;
        match outcome {
            ServiceState::Service => Ok(()),
            ServiceState::Error => Err(ServiceError::Failed),
            ServiceState::Init => Err(ServiceError::NotReady),
        }
    }

    fn ensure_serving(&self) -> Result<(), ServiceError> {
        match self.state() {
            ServiceState::Service => Ok(()),
            ServiceState::Init => Err(ServiceError::NotReady),
            ServiceState::Error => Err(ServiceError::Failed),
        }
    }

    /// Step 1 of the API protocol: take the guard, failing fast on timeout.
    pub async fn lock(
        &self,
        timeout: Duration,
    ) -> Result<MutexGuard<'_, CriticalSectionRawMutex, P>, ServiceError> {
        self.lock_until(Instant::now() + timeout).await
    }

    pub async fn lock_until(
        &self,
        deadline: Instant,
    ) -> Result<MutexGuard<'_, CriticalSectionRawMutex, P>, ServiceError> {
        with_deadline(deadline, self.guard.lock())
            .await
            .map_err(|_| ServiceError::Timeout)
    }

    /// Read the in-memory parameter block without involving the worker.
    pub async fn read<R>(&self, timeout: Duration, f: impl FnOnce(&P) -> R) -> Result<R, ServiceError> {
        self.read_until(Instant::now() + timeout, f).await
    }

    pub async fn read_until<R>(&self, deadline: Instant, f: impl FnOnce(&P) -> R) -> Result<R, ServiceError> {
        let params = self.lock_until(deadline).await?;
        Ok(f(&params))
    }

    /// Write the parameter block without involving the worker.
    pub async fn write(&self, timeout: Duration, f: impl FnOnce(&mut P)) -> Result<(), ServiceError> {
        let mut params = self.lock(timeout).await?;
        f(&mut params);
        Ok(())
    }

    /// Full caller protocol: lock, write, unlock, notify `event`, wait for completion.
    ///
    /// The guard wait and the completion wait each use `timeout`, so a call returns
    /// within twice the timeout. A completion timeout leaves the request queued; the
    /// worker still finishes it later without affecting any other caller's ticket.
    pub async fn request(
        &self,
        event: E,
        timeout: Duration,
        update: impl FnOnce(&mut P),
    ) -> Result<(), ServiceError> {
        let ticket = self.submit(event, Instant::now() + timeout, update).await?;
        self.collect(ticket, Instant::now() + timeout).await
    }

    /// [`request`](Self::request) with one deadline shared by the guard and the
    /// completion, for operations that chain several waits.
    pub async fn request_until(
        &self,
        event: E,
        deadline: Instant,
        update: impl FnOnce(&mut P),
    ) -> Result<(), ServiceError> {
        let ticket = self.submit(event, deadline, update).await?;
        self.collect(ticket, deadline).await
    }

    async fn submit(
        &self,
        event: E,
        deadline: Instant,
        update: impl FnOnce(&mut P),
    ) -> Result<Ticket, ServiceError> {
        self.ensure_serving()?;
        let ticket = {
            let mut params = self.lock_until(deadline).await?;
            update(&mut params);
            self.completions.issue(Self::slot(event))
        };
        self.notifier.notify(event.bits());
        Ok(ticket)
    }

    async fn collect(&self, ticket: Ticket, deadline: Instant) -> Result<(), ServiceError> {
        match with_deadline(deadline, self.completions.wait(ticket)).await {
            Ok(Outcome::Done) => Ok(()),
            Ok(Outcome::Failed) => Err(ServiceError::Device),
            Err(_) => Err(ServiceError::Timeout),
        }
    }

    /// Notify the worker without waiting. Safe from interrupt context.
    pub fn notify_from_isr(&self, event: E) {
        self.notifier.notify_from_isr(event.bits());
    }

    /// Notify the worker without waiting, from task context.
    pub fn notify(&self, event: E) {
        self.notifier.notify(event.bits());
    }

    /// Requests of `event` still waiting for the worker.
    pub fn outstanding(&self, event: E) -> u32 {
        self.completions.outstanding(Self::slot(event))
    }

    // ---- worker side -------------------------------------------------------------

    /// Park until the supervisor calls [`start`](Self::start).
    pub async fn wait_started(&self) {
        self.started.wait().await;
    }

    /// Leave `Init`: drop anything notified during bring-up and release the starter.
    pub fn enter_service(&self) {
        self.notifier.clear();
        self.release(ServiceState::Service);
        info!("{}: successfully initialized", self.name);
    }

    /// Move to the terminal `Error` state without reporting. Used by the supervisor,
    /// which is itself the central sink.
    pub fn mark_failed(&self) {
        self.release(ServiceState::Error);
    }

    /// Enter `Error`, report centrally at low severity and park the worker forever.
    pub async fn fail(&self, sink: &dyn ErrorSink, reason: &str) -> ! {
        self.mark_failed();
        error!("{}: {}", self.name, reason);
        sink.report_error(ErrorLevel::Low);
        park().await
    }

    /// Wait for pending notification bits and take them all.
    pub async fn next_events(&self) -> E {
        E::from_bits_truncate(self.notifier.wait().await)
    }

    /// Copy the parameter block under the guard together with the last ticket issued for
    /// `event`. Completing `event` through that ticket covers every caller whose value
    /// the snapshot reflects.
    pub async fn snapshot(&self, event: E) -> (P, u32)
    where
        P: Clone,
    {
        let params = self.guard.lock().await;
        let through = self.completions.issued(Self::slot(event));
        (params.clone(), through)
    }

    /// Worker-side write of result slots under the guard.
    pub async fn update(&self, f: impl FnOnce(&mut P)) {
        let mut params = self.guard.lock().await;
        f(&mut params);
    }

    /// Release every caller of `event` up to `through`.
    pub fn complete(&self, event: E, through: u32, ok: bool) {
        let outcome = if ok { Outcome::Done } else { Outcome::Failed };
        self.completions.complete(Self::slot(event), through, outcome);
    }
}

/// Suspend the current worker forever.
pub async fn park() -> ! {
    loop {
        pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::{block_on, join::join, select::select};
    use embassy_time::Timer;

    bitflags::bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        struct Events: u32 {
            const FIRST = 1 << 0;
            const SECOND = 1 << 1;
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Params {
        value: u32,
        applied: u32,
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn echo_worker(core: &ServiceCore<Params, Events>) -> ! {
        core.wait_started().await;
        core.enter_service();
        loop {
            let events = core.next_events().await;
            for event in events.iter() {
                let (params, through) = core.snapshot(event).await;
                core.update(|p| p.applied = params.value).await;
                core.complete(event, through, event != Events::SECOND);
            }
        }
    }

    #[test]
    fn calls_before_service_fail_fast() {
        let core: ServiceCore<Params, Events> = ServiceCore::new("test", Params::default());
        let result = block_on(core.request(Events::FIRST, TIMEOUT, |p| p.value = 1));
        assert_eq!(result, Err(ServiceError::NotReady));
        assert_eq!(core.outstanding(Events::FIRST), 0);
    }

    #[test]
    fn request_round_trip_through_worker() {
        let core: ServiceCore<Params, Events> = ServiceCore::new("test", Params::default());
        core.start();
        block_on(async {
            select(echo_worker(&core), async {
                core.wait_ready(TIMEOUT).await.unwrap();
                core.request(Events::FIRST, TIMEOUT, |p| p.value = 7).await.unwrap();
                assert_eq!(core.read(TIMEOUT, |p| p.applied).await, Ok(7));
                assert_eq!(
                    core.request(Events::SECOND, TIMEOUT, |p| p.value = 9).await,
                    Err(ServiceError::Device)
                );
                assert_eq!(core.outstanding(Events::FIRST), 0);
                assert_eq!(core.outstanding(Events::SECOND), 0);
            })
            .await;
        });
    }

    #[test]
    fn concurrent_callers_each_get_their_own_completion() {
        let core: ServiceCore<Params, Events> = ServiceCore::new("test", Params::default());
        core.start();
        block_on(async {
            select(echo_worker(&core), async {
                core.wait_ready(TIMEOUT).await.unwrap();
                let (a, b) = join(
                    core.request(Events::FIRST, TIMEOUT, |p| p.value = 100),
                    core.request(Events::FIRST, TIMEOUT, |p| p.value = 300),
                )
                .await;
                assert_eq!((a, b), (Ok(()), Ok(())));
                let applied = core.read(TIMEOUT, |p| p.applied).await.unwrap();
                assert!(applied == 100 || applied == 300);
                assert_eq!(core.outstanding(Events::FIRST), 0);
            })
            .await;
        });
    }

    #[test]
    fn guard_timeout_has_no_side_effects() {
        let core: ServiceCore<Params, Events> = ServiceCore::new("test", Params::default());
        core.start();
        block_on(async {
            select(echo_worker(&core), async {
                core.wait_ready(TIMEOUT).await.unwrap();
                let held = core.lock(TIMEOUT).await.unwrap();
                let result = core
                    .request(Events::FIRST, Duration::from_millis(20), |p| p.value = 5)
                    .await;
                assert_eq!(result, Err(ServiceError::Timeout));
                assert_eq!(held.value, 0);
                assert_eq!(core.outstanding(Events::FIRST), 0);
            })
            .await;
        });
    }

    #[test]
    fn every_waiter_sees_the_service_come_up() {
        let core: ServiceCore<Params, Events> = ServiceCore::new("test", Params::default());
        block_on(async {
            let bring_up = async {
                Timer::after(Duration::from_millis(10)).await;
                core.enter_service();
            };
            let ((first, second), ()) = join(
                join(core.wait_ready(TIMEOUT), core.wait_ready(TIMEOUT)),
                bring_up,
            )
            .await;
            assert_eq!((first, second), (Ok(()), Ok(())));
        });
        assert_eq!(block_on(core.wait_ready(TIMEOUT)), Ok(()));
    }

    /// Guard held for `hold`, then the request sits with no worker to complete it.
    async fn stalled_request(
        core: &ServiceCore<Params, Events>,
        hold: Duration,
        shared: bool,
    ) -> (Result<(), ServiceError>, Duration) {
        let held = core.lock(TIMEOUT).await.unwrap();
        let budget = Duration::from_millis(40);
        let started = Instant::now();
        let release = async {
            Timer::after(hold).await;
            drop(held);
        };
        let call = async {
            if shared {
                core.request_until(Events::FIRST, started + budget, |p| p.value = 3).await
            } else {
                core.request(Events::FIRST, budget, |p| p.value = 3).await
            }
        };
        let (result, ()) = join(call, release).await;
        (result, started.elapsed())
    }

    #[test]
    fn shared_deadline_bounds_guard_and_completion_together() {
        let core: ServiceCore<Params, Events> = ServiceCore::new("test", Params::default());
        core.enter_service();
        let (result, elapsed) = block_on(stalled_request(&core, Duration::from_millis(30), true));
        assert_eq!(result, Err(ServiceError::Timeout));
        assert!(elapsed < Duration::from_millis(60), "took {:?}", elapsed);
        // The request stays queued for the worker
        assert_eq!(core.outstanding(Events::FIRST), 1);
    }

    #[test]
    fn request_returns_within_twice_the_timeout() {
        let core: ServiceCore<Params, Events> = ServiceCore::new("test", Params::default());
        core.enter_service();
        let (result, elapsed) = block_on(stalled_request(&core, Duration::from_millis(30), false));
        assert_eq!(result, Err(ServiceError::Timeout));
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed <= Duration::from_millis(80) + Duration::from_millis(15), "took {:?}", elapsed);
    }

    #[test]
    fn failed_service_rejects_requests() {
        struct NullSink;
        impl ErrorSink for NullSink {
            fn report_error(&self, _level: ErrorLevel) {}
        }

        let core: ServiceCore<Params, Events> = ServiceCore::new("test", Params::default());
        block_on(async {
            select(core.fail(&NullSink, "bring-up failed"), async {
                assert_eq!(core.wait_ready(TIMEOUT).await, Err(ServiceError::Failed));
                assert_eq!(
                    core.request(Events::FIRST, TIMEOUT, |p| p.value = 1).await,
                    Err(ServiceError::Failed)
                );
            })
            .await;
        });
        assert_eq!(core.state(), ServiceState::Error);
    }
}
