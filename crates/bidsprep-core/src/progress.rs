/// Trait for reporting pipeline progress.
///
/// The CLI implements it with indicatif; library callers get [`SilentReporter`].
/// All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_run_start(&self, _subjects: usize) {}
    fn on_subject_start(&self, _subject: &str) {}
    fn on_stage_start(&self, _subject: &str, _stage: &str) {}
    fn on_tool_start(&self, _tool: &str) {}
    fn on_tool_skipped(&self, _tool: &str) {}
    fn on_tool_complete(&self, _tool: &str) {}
    fn on_subject_complete(&self, _subject: &str, _ok: bool) {}
    fn on_run_complete(&self, _failures: usize, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
