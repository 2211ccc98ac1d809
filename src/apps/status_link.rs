//! Status link: short tagged ASCII messages for operators and peers.
//!
//! Services emit through the [`StatusLink`] trait; [`StatusChannel`] is the firmware's
//! implementation, a bounded queue the network side drains.

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use heapless::String;


/// Longest message carried by the link, terminator included
pub const MESSAGE_CAPACITY: usize = 64;

/// Message emitted when the charger reports charge termination
pub const CHARGE_DONE_MESSAGE: &str = "charger charging done\r\n";
/// Message emitted on a battery under-voltage lockout
pub const UNDERVOLTAGE_MESSAGE: &str = "charger uvoltage\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageKind {
    /// Something happened that a peer may act on
    Action,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub kind: MessageKind,
    pub text: String<MESSAGE_CAPACITY>,
}

/// Sink for status messages. Implementations are internally synchronized and never
/// block the sender.
pub trait StatusLink {
    fn send(&self, kind: MessageKind, message: &str);
}

/// Bounded queue of status messages. Full queue or oversized messages are dropped.
pub struct StatusChannel<const N: usize> {
    queue: Channel<CriticalSectionRawMutex, StatusMessage, N>,
}

impl<const N: usize> StatusChannel<N> {
    pub const fn new() -> Self {
        Self { queue: Channel::new() }
    }

    /// Next queued message, waiting if none is pending.
    pub async fn receive(&self) -> StatusMessage {
        self.queue.receive().await
    }

    pub fn try_receive(&self) -> Option<StatusMessage> {
        self.queue.try_receive().ok()
    }
}

impl<const N: usize> Default for StatusChannel<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StatusLink for StatusChannel<N> {
    fn send(&self, kind: MessageKind, message: &str) {
        let Ok(text) = String::try_from(message) else {
            warn!("status link: message of {} bytes dropped", message.len());
            return;
        };
        if self.queue.try_send(StatusMessage { kind, text }).is_err() {
            warn!("status link: queue full, message dropped");
        }
    }
}
