//! Reporter implementations for terminal output.

use gh_aw::engine::Reporter;
use indicatif::{ProgressBar, ProgressStyle};

/// Plain stderr reporter, used when stderr is not a terminal or under
/// `--json-report` (stdout stays machine-readable).
pub struct StderrReporter;

impl Reporter for StderrReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// Spinner-backed reporter for interactive runs; messages print above the
/// spinner so they survive redraws.
pub struct SpinnerReporter {
    bar: ProgressBar,
}

impl SpinnerReporter {
    pub fn new(message: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .expect("static template is valid"),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { bar }
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
    }
}

impl Reporter for SpinnerReporter {
    fn info(&mut self, msg: &str) {
        self.bar.println(format!("[info] {msg}"));
    }

    fn warn(&mut self, msg: &str) {
        self.bar.println(format!("[warn] {msg}"));
    }

    fn error(&mut self, msg: &str) {
        self.bar.println(format!("[error] {msg}"));
    }
}
