//! Stage pipeline and live progress for a creation run.
//!
//! Progress is held in memory only. The orchestrator and the progress callbacks of the
//! active service write through [`ProgressTracker`]; any number of observers read
//! snapshots or wait on changes via [`ProgressTracker::subscribe`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Number of ordinal stages before `Complete`; each weighs `1 / TOTAL_STAGES`.
pub const TOTAL_STAGES: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationStage {
    Preparing,
    Formatting,
    MountingImage,
    CopyingBootFiles,
    SplittingPayload,
    CopyingPayload,
    Finalizing,
    Complete,
    /// Terminal, outside the ordinal sequence.
    Failed,
}

impl CreationStage {
    /// Position in the pipeline; `None` for `Failed`.
    pub fn ordinal(self) -> Option<u32> {
        match self {
            CreationStage::Preparing => Some(0),
            CreationStage::Formatting => Some(1),
            CreationStage::MountingImage => Some(2),
            CreationStage::CopyingBootFiles => Some(3),
            CreationStage::SplittingPayload => Some(4),
            CreationStage::CopyingPayload => Some(5),
            CreationStage::Finalizing => Some(6),
            CreationStage::Complete => Some(7),
            CreationStage::Failed => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CreationStage::Preparing => "Preparing...",
            CreationStage::Formatting => "Formatting USB drive...",
            CreationStage::MountingImage => "Mounting Windows ISO...",
            CreationStage::CopyingBootFiles => "Copying boot files...",
            CreationStage::SplittingPayload => "Splitting install.wim...",
            CreationStage::CopyingPayload => "Copying Windows image...",
            CreationStage::Finalizing => "Finalizing...",
            CreationStage::Complete => "Complete!",
            CreationStage::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CreationStage::Complete | CreationStage::Failed)
    }
}

impl fmt::Display for CreationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `ordinal / 7 + fraction / 7`, clamped to `[0, 1]`.
///
/// A failed run reports 0 here; [`CreationProgress`] keeps the last value it had instead.
pub fn overall_progress(stage: CreationStage, fraction: f64) -> f64 {
    let Some(ordinal) = stage.ordinal() else {
        return 0.0;
    };
    let total = f64::from(TOTAL_STAGES);
    (f64::from(ordinal) / total + fraction.clamp(0.0, 1.0) / total).clamp(0.0, 1.0)
}

/// Snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreationProgress {
    pub stage: CreationStage,
    /// Fraction of the current stage, `[0, 1]`
    pub stage_progress: f64,
    /// Fraction of the whole run, `[0, 1]`
    pub overall_progress: f64,
    pub current_file: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
    pub is_complete: bool,
    pub is_failed: bool,
}

impl Default for CreationProgress {
    fn default() -> Self {
        Self {
            stage: CreationStage::Preparing,
            stage_progress: 0.0,
            overall_progress: 0.0,
            current_file: String::new(),
            bytes_transferred: 0,
            total_bytes: 0,
            error: None,
            is_complete: false,
            is_failed: false,
        }
    }
}

impl CreationProgress {
    fn is_frozen(&self) -> bool {
        self.is_failed || self.is_complete
    }

    /// Move to `stage` with zero progress inside it. Ignored once the run has ended, and
    /// for a stage earlier than the current one.
    pub fn enter_stage(&mut self, stage: CreationStage) {
        if self.is_frozen() {
            return;
        }
        if let (Some(current), Some(next)) = (self.stage.ordinal(), stage.ordinal()) {
            if next < current {
                debug!(from = %self.stage, to = %stage, "Ignoring backward stage transition");
                return;
            }
        }
        match stage {
            CreationStage::Complete => self.complete(),
            CreationStage::Failed => self.fail("Failed"),
            _ => {
                self.stage = stage;
                self.stage_progress = 0.0;
                self.current_file.clear();
                self.bytes_transferred = 0;
                self.total_bytes = 0;
                self.overall_progress = overall_progress(stage, 0.0);
            }
        }
    }

    /// Set the fraction done within the current stage.
    pub fn set_stage_progress(&mut self, fraction: f64) {
        if self.is_frozen() {
            return;
        }
        self.stage_progress = fraction.clamp(0.0, 1.0);
        self.overall_progress = overall_progress(self.stage, self.stage_progress);
    }

    /// Record byte progress. Bytes are clamped to `total`; with `total == 0` the stage
    /// fraction is left as it was.
    pub fn update_transfer(&mut self, transferred: u64, total: u64, file: &str) {
        if self.is_frozen() {
            return;
        }
        self.total_bytes = total;
        self.bytes_transferred = transferred.min(total);
        if !file.is_empty() {
            self.current_file = file.to_string();
        }
        if total > 0 {
            self.set_stage_progress(self.bytes_transferred as f64 / total as f64);
        }
    }

    pub fn set_status(&mut self, status: &str) {
        if !self.is_frozen() {
            self.current_file = status.to_string();
        }
    }

    /// Enter the failed state. Only the first failure message is kept.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_frozen() {
            return;
        }
        self.stage = CreationStage::Failed;
        self.is_failed = true;
        self.error = Some(message.into());
    }

    pub fn complete(&mut self) {
        if self.is_failed {
            return;
        }
        self.stage = CreationStage::Complete;
        self.is_complete = true;
        self.stage_progress = 1.0;
        self.overall_progress = 1.0;
    }

    pub fn bytes_transferred_formatted(&self) -> String {
        crate::core::models::format_bytes(self.bytes_transferred)
    }

    pub fn total_bytes_formatted(&self) -> String {
        crate::core::models::format_bytes(self.total_bytes)
    }
}

/// Shared handle to the progress of the current run.
///
/// Cheap to clone; every clone publishes to the same observers.
#[derive(Clone)]
pub struct ProgressTracker {
    tx: Arc<watch::Sender<CreationProgress>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CreationProgress::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> CreationProgress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CreationProgress> {
        self.tx.subscribe()
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut CreationProgress),
    {
        self.tx.send_modify(f);
    }

    pub fn enter_stage(&self, stage: CreationStage) {
        self.update(|p| p.enter_stage(stage));
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|p| p.fail(message));
    }

    /// Start over from `Preparing`.
    pub fn reset(&self) {
        self.tx.send_replace(CreationProgress::default());
    }
}
