//! Install phases and the progress event schema.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::WireError;

/// Install state machine phase.
///
/// `idle → downloading → verifying → extracting → ready`, with `failed`
/// and `cancelled` reachable from any non-terminal phase. `extracting` is
/// skipped when no artifact is an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallPhase {
    Idle,
    Downloading,
    Verifying,
    Extracting,
    Ready,
    Failed,
    Cancelled,
}

impl InstallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Cancelled)
    }
}

/// One progress event on an install stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    pub request_id: String,
    pub model_id: String,
    pub version: String,
    pub phase: InstallPhase,
    pub received_bytes: u64,
    pub total_bytes: u64,
    /// Download fraction in `[0, 1]`; verifying and extracting report 1.0
    /// of their phase.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl InstallProgress {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Shared slot holding the most recent progress event, for state queries.
pub(crate) type ProgressMirror = std::sync::Arc<std::sync::Mutex<Option<InstallProgress>>>;

/// Emits progress events with download-phase coalescing: a phase change
/// always emits; byte progress emits at most every interval or whole
/// percent, whichever comes sooner.
pub struct ProgressEmitter {
    tx: broadcast::Sender<InstallProgress>,
    request_id: String,
    model_id: String,
    version: String,
    total_bytes: u64,
    received_bytes: u64,
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: i64,
    mirror: Option<ProgressMirror>,
}

impl ProgressEmitter {
    pub fn new(
        tx: broadcast::Sender<InstallProgress>,
        request_id: String,
        model_id: String,
        version: String,
        total_bytes: u64,
        interval: Duration,
    ) -> Self {
        Self {
            tx,
            request_id,
            model_id,
            version,
            total_bytes,
            received_bytes: 0,
            interval,
            last_emit: None,
            last_percent: -1,
            mirror: None,
        }
    }

    /// Mirror every emitted event into a shared slot.
    pub(crate) fn with_mirror(mut self, mirror: ProgressMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    fn event(&self, phase: InstallPhase, progress: f64, error: Option<WireError>) -> InstallProgress {
        InstallProgress {
            request_id: self.request_id.clone(),
            model_id: self.model_id.clone(),
            version: self.version.clone(),
            phase,
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            progress,
            error,
        }
    }

    fn send(&mut self, event: InstallProgress) {
        if let Some(mirror) = &self.mirror {
            *mirror.lock().unwrap() = Some(event.clone());
        }
        // Nobody listening is fine; broadcast keeps the pipeline moving.
        let _ = self.tx.send(event);
        self.last_emit = Some(Instant::now());
    }

    /// Emit a phase transition. Non-download phases report their own
    /// completion fraction.
    pub fn phase(&mut self, phase: InstallPhase) {
        let progress = match phase {
            InstallPhase::Idle => 0.0,
            InstallPhase::Downloading => self.download_fraction(),
            _ => 1.0,
        };
        let event = self.event(phase, progress, None);
        self.send(event);
    }

    /// Record downloaded bytes, emitting under the coalescing rule.
    pub fn downloaded(&mut self, delta: u64) {
        self.received_bytes += delta;
        let percent = (self.download_fraction() * 100.0) as i64;
        let due_time = self
            .last_emit
            .map(|t| t.elapsed() >= self.interval)
            .unwrap_or(true);
        let due_percent = percent > self.last_percent;
        if due_time || due_percent {
            self.last_percent = percent;
            let fraction = self.download_fraction();
            let event = self.event(InstallPhase::Downloading, fraction, None);
            self.send(event);
        }
    }

    pub fn ready(&mut self) {
        let event = self.event(InstallPhase::Ready, 1.0, None);
        self.send(event);
    }

    pub fn failed(&mut self, error: WireError) {
        let fraction = self.download_fraction();
        let event = self.event(InstallPhase::Failed, fraction, Some(error));
        self.send(event);
    }

    pub fn cancelled(&mut self) {
        let fraction = self.download_fraction();
        let event = self.event(InstallPhase::Cancelled, fraction, None);
        self.send(event);
    }

    fn download_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.received_bytes as f64 / self.total_bytes as f64).min(1.0)
        }
    }
}
