//! Progress events emitted while a lifecycle operation runs.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// Status of a long-running operation, in the order they can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressStatus {
    ReadingShare,
    GeneratingShare,
    ParsingShare,
    EncryptingShare,
    DecryptingShare,
    StoringShare,
    RecoveringSigningShare,
    RecoveringBackupShare,
    Done,
}

impl ProgressStatus {
    pub fn display_status(&self) -> &'static str {
        match self {
            ProgressStatus::ReadingShare => "Reading share",
            ProgressStatus::GeneratingShare => "Generating share",
            ProgressStatus::ParsingShare => "Parsing share",
            ProgressStatus::EncryptingShare => "Encrypting share",
            ProgressStatus::DecryptingShare => "Decrypting share",
            ProgressStatus::StoringShare => "Storing share",
            ProgressStatus::RecoveringSigningShare => "Recovering signing share",
            ProgressStatus::RecoveringBackupShare => "Recovering backup share",
            ProgressStatus::Done => "Done",
        }
    }
}

/// Sink for progress events. Called synchronously by the operation driving it.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, status: ProgressStatus);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _status: ProgressStatus) {}
}

impl<F> ProgressReporter for F
where
    F: Fn(ProgressStatus) + Send + Sync,
{
    fn report(&self, status: ProgressStatus) {
        self(status)
    }
}

/// Forwards events into an unbounded channel, e.g. for a UI task
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressStatus>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, status: ProgressStatus) {
        // A closed receiver only means nobody is watching anymore
        let _ = self.tx.send(status);
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressStatus>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressStatus> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, status: ProgressStatus) {
        if let Ok(mut events) = self.events.lock() {
            events.push(status);
        }
    }
}
