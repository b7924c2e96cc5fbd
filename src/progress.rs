use std::sync::Mutex;

use crate::{manifest::Outcome, protocol::Protocol};

/// Observational events emitted while entries are processed.
/// Nothing in the download path depends on how (or whether) they are consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A candidate was opened; bytes will be written starting at `offset`.
    Started {
        id: String,
        url: String,
        protocol: Protocol,
        offset: u64,
        remote_size: Option<u64>,
    },
    /// One chunk was appended to the partial file.
    Advanced {
        id: String,
        bytes_written: u64,
        remote_size: Option<u64>,
    },
    /// The entry concluded for this pass.
    Finished { id: String, outcome: Outcome },
}

/// Receives progress events. Implementations are shared across workers and
/// must serialize their own output.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn report(&self, _event: ProgressEvent) {}
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// `bytes_written` of every `Advanced` event for `id`.
    pub fn advances(&self, id: &str) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Advanced {
                    id: event_id,
                    bytes_written,
                    ..
                } if event_id == id => Some(bytes_written),
                _ => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
