use bidsprep_core::ProgressReporter;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// CLI progress reporter: one bar counting finished subjects, its message
/// tracking the latest stage or tool.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.bar.lock().unwrap();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        let mut guard = self.bar.lock().unwrap();
        if let Some(pb) = guard.take() {
            pb.finish_and_clear();
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let guard = self.bar.lock().unwrap();
        if let Some(pb) = guard.as_ref() {
            f(pb);
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_run_start(&self, subjects: usize) {
        let pb = ProgressBar::new(subjects as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "  {spinner:.cyan} Subjects [{bar:30.cyan/dim}] {pos}/{len} {msg}",
            )
            .unwrap()
            .progress_chars("━╸─")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_stage_start(&self, subject: &str, stage: &str) {
        self.with_bar(|pb| pb.set_message(format!("sub-{} {}", subject, stage)));
    }

    fn on_tool_start(&self, tool: &str) {
        self.with_bar(|pb| pb.set_message(format!("running {}", tool)));
    }

    fn on_subject_complete(&self, subject: &str, ok: bool) {
        self.with_bar(|pb| {
            pb.inc(1);
            pb.suspend(|| {
                if ok {
                    eprintln!("  \x1b[32m✓\x1b[0m sub-{}", subject);
                } else {
                    eprintln!("  \x1b[31m✗\x1b[0m sub-{}", subject);
                }
            });
        });
    }

    fn on_run_complete(&self, failures: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Run complete: {} failure(s) in {:.2}s",
            failures, duration_secs
        );
    }
}
