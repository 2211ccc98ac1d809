//! Per-request completion tickets.
//!
//! Each notification bit owns a slot with two sequence numbers: `issued` counts requests
//! handed to the worker, `completed` is the highest request the worker has finished. A
//! caller waits for its own ticket, so a caller that timed out can never release (or be
//! released by) somebody else's completion.
//!
//! The worker samples `issued` together with the parameter snapshot under the guard, so
//! one device pass completes every request whose value it observed. The outcome of each
//! pass is kept per request in a short history, so a later pass never rewrites the
//! result an earlier caller is about to collect.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex},
    waitqueue::MultiWakerRegistration,
};

/// Number of notification bits a ledger tracks.
pub const SLOTS: usize = 32;

/// Concurrent waiters registered before the ledger wakes everybody to re-register.
const MAX_WAITERS: usize = 8;

/// Completed requests per slot whose outcome is still known.
const HISTORY: u32 = u64::BITS;

/// Position of a single request in its slot's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ticket {
    slot: u8,
    seq: u32,
}

impl Ticket {
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

/// Result the worker attached to the pass that covered a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Done,
    Failed,
}

struct Ledger {
    issued: [u32; SLOTS],
    completed: [u32; SLOTS],
    /// Bit `n` set: request `completed - n` failed
    history: [u64; SLOTS],
    waiters: MultiWakerRegistration<MAX_WAITERS>,
}

impl Ledger {
    /// Outcome of a completed request. Requests older than the history count as failed.
    fn outcome(&self, slot: usize, seq: u32) -> Outcome {
        let age = self.completed[slot].wrapping_sub(seq);
        if age >= HISTORY || self.history[slot] & (1 << age) != 0 {
            Outcome::Failed
        } else {
            Outcome::Done
        }
    }
}

/// `a` is at or after `b` in wrapping sequence order.
fn reached(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 >= 0
}

pub struct Completions {
    ledger: Mutex<CriticalSectionRawMutex, RefCell<Ledger>>,
}

impl Completions {
    pub const fn new() -> Self {
        Self {
            ledger: Mutex::new(RefCell::new(Ledger {
                issued: [0; SLOTS],
                completed: [0; SLOTS],
                history: [0; SLOTS],
                waiters: MultiWakerRegistration::new(),
            })),
        }
    }

    /// Hand out the next ticket for `slot`. Callers do this while holding the guard.
    pub fn issue(&self, slot: usize) -> Ticket {
        self.ledger.lock(|ledger| {
            let mut ledger = ledger.borrow_mut();
            ledger.issued[slot] = ledger.issued[slot].wrapping_add(1);
            Ticket {
                slot: slot as u8,
                seq: ledger.issued[slot],
            }
        })
    }

    /// Latest ticket handed out for `slot`. The worker reads this under the guard.
    pub fn issued(&self, slot: usize) -> u32 {
        self.ledger.lock(|ledger| ledger.borrow().issued[slot])
    }

    /// Complete every request of `slot` up to and including `through`.
    pub fn complete(&self, slot: usize, through: u32, outcome: Outcome) {
        self.ledger.lock(|ledger| {
            let mut ledger = ledger.borrow_mut();
            let advance = through.wrapping_sub(ledger.completed[slot]);
            if advance as i32 > 0 {
                let (kept, covered) = if advance >= HISTORY {
                    (0, u64::MAX)
                } else {
                    (ledger.history[slot] << advance, (1u64 << advance) - 1)
                };
                ledger.history[slot] = match outcome {
                    Outcome::Done => kept,
                    Outcome::Failed => kept | covered,
                };
                ledger.completed[slot] = through;
            }
            ledger.waiters.wake();
        });
    }

    /// Requests of `slot` handed out but not yet completed.
    pub fn outstanding(&self, slot: usize) -> u32 {
        self.ledger.lock(|ledger| {
            let ledger = ledger.borrow();
            ledger.issued[slot].wrapping_sub(ledger.completed[slot])
        })
    }

    /// Wait until the worker has completed `ticket`.
    pub async fn wait(&self, ticket: Ticket) -> Outcome {
        let slot = ticket.slot();
        poll_fn(|cx| {
            self.ledger.lock(|ledger| {
                let mut ledger = ledger.borrow_mut();
                if reached(ledger.completed[slot], ticket.seq) {
                    Poll::Ready(ledger.outcome(slot, ticket.seq))
                } else {
                    ledger.waiters.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }
}

impl Default for Completions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::{block_on, select::select, select::Either};
    use embassy_futures::yield_now;

    #[test]
    fn one_pass_completes_every_covered_ticket() {
        let completions = Completions::new();
        let first = completions.issue(1);
        let second = completions.issue(1);
        assert_eq!(completions.outstanding(1), 2);

        let through = completions.issued(1);
        completions.complete(1, through, Outcome::Done);

        assert_eq!(block_on(completions.wait(first)), Outcome::Done);
        assert_eq!(block_on(completions.wait(second)), Outcome::Done);
        assert_eq!(completions.outstanding(1), 0);
    }

    #[test]
    fn later_ticket_is_not_released_by_an_earlier_pass() {
        let completions = Completions::new();
        let first = completions.issue(0);
        completions.complete(0, first.seq(), Outcome::Done);
        let second = completions.issue(0);

        let result = block_on(async {
            match select(completions.wait(second), async {
                for _ in 0..16 {
                    yield_now().await;
                }
            })
            .await
            {
                Either::First(outcome) => Some(outcome),
                Either::Second(()) => None,
            }
        });
        assert_eq!(result, None);
        assert_eq!(completions.outstanding(0), 1);
    }

    #[test]
    fn failure_is_reported_per_slot() {
        let completions = Completions::new();
        let charging = completions.issue(0);
        let voltage = completions.issue(3);

        completions.complete(0, charging.seq(), Outcome::Failed);
        completions.complete(3, voltage.seq(), Outcome::Done);

        assert_eq!(block_on(completions.wait(charging)), Outcome::Failed);
        assert_eq!(block_on(completions.wait(voltage)), Outcome::Done);
    }

    #[test]
    fn later_success_does_not_hide_an_earlier_failure() {
        let completions = Completions::new();
        let first = completions.issue(1);
        completions.complete(1, first.seq(), Outcome::Failed);
        let second = completions.issue(1);
        completions.complete(1, second.seq(), Outcome::Done);

        assert_eq!(block_on(completions.wait(first)), Outcome::Failed);
        assert_eq!(block_on(completions.wait(second)), Outcome::Done);
    }

    #[test]
    fn one_failed_pass_fails_every_ticket_it_covered() {
        let completions = Completions::new();
        let before = completions.issue(4);
        completions.complete(4, before.seq(), Outcome::Done);
        let first = completions.issue(4);
        let second = completions.issue(4);
        completions.complete(4, second.seq(), Outcome::Failed);
        let after = completions.issue(4);
        completions.complete(4, after.seq(), Outcome::Done);

        assert_eq!(block_on(completions.wait(before)), Outcome::Done);
        assert_eq!(block_on(completions.wait(first)), Outcome::Failed);
        assert_eq!(block_on(completions.wait(second)), Outcome::Failed);
        assert_eq!(block_on(completions.wait(after)), Outcome::Done);
    }

    #[test]
    fn stale_completion_does_not_move_sequence_backwards() {
        let completions = Completions::new();
        completions.issue(2);
        completions.issue(2);
        completions.complete(2, 2, Outcome::Done);
        completions.complete(2, 1, Outcome::Done);
        assert_eq!(completions.outstanding(2), 0);
    }
}
