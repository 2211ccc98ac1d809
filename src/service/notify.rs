//! Bit-flag notification word between a service's callers and its worker.
//!
//! Callers and interrupt handlers OR bits into the word; the worker drains the whole
//! word on each wake. Identical requests that arrive between two wakes coalesce into a
//! single bit.

use core::sync::atomic::{AtomicU32, Ordering};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};

/// 32-bit pending-work word with a wake signal for the owning worker.
pub struct Notifier {
    pending: AtomicU32,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl Notifier {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            wake: Signal::new(),
        }
    }

    /// OR `bits` into the pending word and wake the worker.
    pub fn notify(&self, bits: u32) {
        if bits == 0 {
            return;
        }
        self.pending.fetch_or(bits, Ordering::AcqRel);
        self.wake.signal(());
    }

    /// Interrupt-context notification.
    ///
    /// Only touches the atomic word and the critical-section protected signal, so it never
    /// blocks and never allocates. Waking the worker's task pends the executor, which is
    /// the embassy equivalent of yielding from the ISR to a higher-priority task.
    #[inline]
    pub fn notify_from_isr(&self, bits: u32) {
        self.notify(bits);
    }

    /// Wait until at least one bit is pending, then take the whole word.
    pub async fn wait(&self) -> u32 {
        loop {
            let bits = self.pending.swap(0, Ordering::AcqRel);
            if bits != 0 {
                return bits;
            }
            self.wake.wait().await;
        }
    }

    /// Drop everything pending. Used when a worker enters service.
    pub fn clear(&self) {
        self.pending.store(0, Ordering::Release);
        self.wake.reset();
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
