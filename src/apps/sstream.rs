//! Boundary of the sample-stream (SSTREAM) subsystem.
//!
//! The acquisition pipeline itself lives outside this crate. What the services need from
//! it is the most recent raw sample of a stream and a notification whenever a stream's
//! acquisition state changes. [`SampleStreamHub`] holds both.

use core::cell::RefCell;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use heapless::Vec;

/// Largest raw sample the hub keeps per stream
pub const MAX_SAMPLE_LEN: usize = 32;

/// Number of streams the hub tracks
pub const MAX_STREAMS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamId(pub u8);

/// Acquisition state as the sample stream reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamAcquisition {
    Active,
    Inactive,
    /// Any state the stream reports that is neither running nor stopped, e.g. while
    /// being reconfigured
    Transitional,
}

/// Read access to the latest sample of a stream.
pub trait SampleSource {
    /// Copy the most recent raw sample of `stream` into `out` and return its length.
    fn last_sample(&self, stream: StreamId, out: &mut [u8]) -> Option<usize>;
}

/// Receiver of acquisition state changes. Called from the stream's context; must not
/// block.
pub trait AcquisitionListener: Sync {
    fn acquisition_changed(&self, stream: StreamId, state: StreamAcquisition);
}

/// Errors from the sample-stream boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamError {
    UnknownStream,
    SampleTooLong,
    ListenerAlreadyRegistered,
}

struct HubState {
    samples: [Option<Vec<u8, MAX_SAMPLE_LEN>>; MAX_STREAMS],
    listener: Option<&'static dyn AcquisitionListener>,
}

/// Latest-sample store and acquisition callback registry.
pub struct SampleStreamHub {
    state: Mutex<CriticalSectionRawMutex, RefCell<HubState>>,
}

impl SampleStreamHub {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(HubState {
                samples: [None, None, None, None],
                listener: None,
            })),
        }
    }

    /// Register the single acquisition listener.
    pub fn register_listener(&self, listener: &'static dyn AcquisitionListener) -> Result<(), StreamError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.listener.is_some() {
                return Err(StreamError::ListenerAlreadyRegistered);
            }
            state.listener = Some(listener);
            Ok(())
        })
    }

    /// Store the newest raw sample of `stream`.
    pub fn publish(&self, stream: StreamId, sample: &[u8]) -> Result<(), StreamError> {
        let sample = Vec::from_slice(sample).map_err(|_| StreamError::SampleTooLong)?;
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let slot = state
                .samples
                .get_mut(stream.0 as usize)
                .ok_or(StreamError::UnknownStream)?;
            *slot = Some(sample);
            Ok(())
        })
    }

    /// Report a change of acquisition state. A stream that stops also drops its sample.
    pub fn set_acquisition(&self, stream: StreamId, state: StreamAcquisition) -> Result<(), StreamError> {
        let listener = self.state.lock(|hub| {
            let mut hub = hub.borrow_mut();
            let slot = hub
                .samples
                .get_mut(stream.0 as usize)
                .ok_or(StreamError::UnknownStream)?;
            if state == StreamAcquisition::Inactive {
                *slot = None;
            }
            Ok(hub.listener)
        })?;

        // Called outside the critical section
        if let Some(listener) = listener {
            listener.acquisition_changed(stream, state);
        }
        Ok(())
    }
}

impl Default for SampleStreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for SampleStreamHub {
    fn last_sample(&self, stream: StreamId, out: &mut [u8]) -> Option<usize> {
        self.state.lock(|state| {
            let state = state.borrow();
            let sample = state.samples.get(stream.0 as usize)?.as_ref()?;
            let len = sample.len().min(out.len());
            out[..len].copy_from_slice(&sample[..len]);
            Some(len)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder(StdMutex<std::vec::Vec<(StreamId, StreamAcquisition)>>);

    impl AcquisitionListener for Recorder {
        fn acquisition_changed(&self, stream: StreamId, state: StreamAcquisition) {
            self.0.lock().unwrap().push((stream, state));
        }
    }

    #[test]
    fn latest_sample_wins() {
        let hub = SampleStreamHub::new();
        hub.publish(StreamId(1), &[1, 2, 3]).unwrap();
        hub.publish(StreamId(1), &[4, 5, 6, 7]).unwrap();

        let mut out = [0u8; 8];
        assert_eq!(hub.last_sample(StreamId(1), &mut out), Some(4));
        assert_eq!(&out[..4], &[4, 5, 6, 7]);
        assert_eq!(hub.last_sample(StreamId(0), &mut out), None);
    }

    #[test]
    fn unknown_stream_is_rejected() {
        let hub = SampleStreamHub::new();
        assert_eq!(hub.publish(StreamId(9), &[0]), Err(StreamError::UnknownStream));
        assert_eq!(hub.publish(StreamId(0), &[0; 40]), Err(StreamError::SampleTooLong));
    }

    #[test]
    fn acquisition_changes_reach_the_listener() {
        let hub = SampleStreamHub::new();
        let recorder: &'static Recorder = Box::leak(Box::new(Recorder(StdMutex::new(std::vec::Vec::new()))));
        hub.register_listener(recorder).unwrap();
        assert_eq!(
            hub.register_listener(recorder),
            Err(StreamError::ListenerAlreadyRegistered)
        );

        hub.publish(StreamId(2), &[0xAB; 10]).unwrap();
        hub.set_acquisition(StreamId(2), StreamAcquisition::Active).unwrap();
        hub.set_acquisition(StreamId(2), StreamAcquisition::Inactive).unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            [
                (StreamId(2), StreamAcquisition::Active),
                (StreamId(2), StreamAcquisition::Inactive)
            ]
        );
        let mut out = [0u8; 10];
        assert_eq!(hub.last_sample(StreamId(2), &mut out), None);
    }
}
