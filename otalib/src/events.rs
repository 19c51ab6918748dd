use std::sync::Mutex;

use log::trace;
use tokio::sync::mpsc;

use crate::{error::ErrorKind, state::DownloadState};

/// Notifications for UI and notification collaborators.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DownloadEvent {
    Started,
    Progress {
        percent: u8,
        bytes_done: u64,
        total_bytes: u64,
        eta_seconds: Option<u64>,
    },
    /// `queued` is true when the transfer resumes by itself once connectivity
    /// returns.
    Paused {
        queued: bool,
    },
    Cancelled,
    Error {
        kind: ErrorKind,
        is_internal: bool,
        is_storage: bool,
        is_server: bool,
    },
    VerifyStarted,
    VerifyFailed,
    VerifyComplete {
        should_launch_install: bool,
    },
    StatusSnapshot {
        state: DownloadState,
        progress: u8,
    },
}

impl DownloadEvent {
    pub fn error(kind: ErrorKind) -> Self {
        Self::Error {
            kind,
            is_internal: kind.is_internal(),
            is_storage: kind.is_storage(),
            is_server: kind.is_server(),
        }
    }
}

/// Fan-out of events to any number of subscribers. Every subscriber receives
/// every event in publication order. Channels are unbounded so that a slow
/// consumer can never cause terminal events to be dropped.
#[derive(Debug, Default)]
pub struct EventPublisher {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DownloadEvent>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: DownloadEvent) {
        trace!("Publishing event: {:?}", event);

        // Subscribers that went away are dropped
        self.subscribers.lock().unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
