//! Terminal UI: progress for a reconcile run, plus a stderr writer for logs.
//!
//! The progress bar and stderr handling is adapted from `substudy` by Eric
//! Kidd, which is licensed under Apache-2.0 OR MIT. Used with permission.

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::queues::{
    reconcile::DocumentOutput,
    work::{WorkOutput, WorkStatus},
};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// A UI that draws nothing.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::with_draw_target(
                ProgressDrawTarget::hidden(),
            )),
        }
    }

    /// Hide all our progress bars, for when we're writing JSONL to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// A writer for `tracing` that draws around our progress bars.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Print a one-line summary to stderr, above any progress bars.
    pub fn display_message(&self, emoji: &str, msg: &str) {
        self.multi_progress.suspend(|| eprintln!("{emoji} {msg}"));
    }

    /// A spinner shown while we count input records.
    pub fn counting_spinner(&self) -> ProgressBar {
        let style = ProgressStyle::default_spinner()
            .template("{spinner} 🧮 {msg}")
            .expect("bad progress bar template");
        let spinner = self.add(ProgressBar::new_spinner().with_style(style));
        spinner.set_message("Counting input records");
        spinner
    }

    /// Progress for a reconcile run. With no `document_count`, we show a
    /// spinner instead of a bar.
    pub fn reconcile_progress(&self, document_count: Option<usize>) -> ReconcileProgress {
        let bar = match document_count {
            Some(len) if len > 0 => {
                let style = ProgressStyle::default_bar()
                    .template(
                        "  📑 {pos:>4}/{len:4} docs {elapsed_precise} {wide_bar:.cyan/blue} {msg}",
                    )
                    .expect("bad progress bar template");
                ProgressBar::new(u64::try_from(len).unwrap_or(u64::MAX)).with_style(style)
            }
            _ => {
                let style = ProgressStyle::default_spinner()
                    .template("{spinner} 📑 {pos} docs {msg}")
                    .expect("bad progress bar template");
                ProgressBar::new_spinner().with_style(style)
            }
        };
        ReconcileProgress {
            bar: self.add(bar),
            tally: Arc::new(Mutex::new(PageTally::default())),
        }
    }

    fn add(&self, pb: ProgressBar) -> ProgressBar {
        let pb = self.multi_progress.add(pb);
        #[cfg(test)]
        pb.set_draw_target(ProgressDrawTarget::hidden());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb
    }
}

/// Running totals shown next to the document bar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageTally {
    pub pages: usize,
    pub ocr_pages: usize,
    pub degraded_documents: usize,
    pub failed_documents: usize,
}

impl PageTally {
    fn record(&mut self, output: &WorkOutput<DocumentOutput>) {
        self.pages += output.data.page_count;
        self.ocr_pages += output.data.ocr_page_count;
        match output.status {
            WorkStatus::Ok => {}
            WorkStatus::Incomplete => self.degraded_documents += 1,
            WorkStatus::Failed => self.failed_documents += 1,
        }
    }

    fn message(&self) -> String {
        let mut msg = format!("{} pages, {} via OCR", self.pages, self.ocr_pages);
        if self.degraded_documents > 0 {
            msg.push_str(&format!(", {} degraded", self.degraded_documents));
        }
        if self.failed_documents > 0 {
            msg.push_str(&format!(", {} failed", self.failed_documents));
        }
        msg
    }
}

/// Document-level progress, with page and OCR counts.
#[derive(Clone)]
pub struct ReconcileProgress {
    bar: ProgressBar,
    tally: Arc<Mutex<PageTally>>,
}

impl ReconcileProgress {
    /// Count a finished document.
    pub fn record(&self, output: &WorkOutput<DocumentOutput>) {
        // A poisoned tally only costs us the message.
        if let Ok(mut tally) = self.tally.lock() {
            tally.record(output);
            self.bar.set_message(tally.message());
        }
        self.bar.inc(1);
    }

    pub fn tally(&self) -> PageTally {
        self.tally.lock().map(|tally| *tally).unwrap_or_default()
    }

    /// Leave the bar on screen with the final totals.
    pub fn finish(&self) {
        let msg = format!("done: {}", self.tally().message());
        self.bar.finish_with_message(msg);
    }
}

/// A writer which can used to write to `stderr`. It hides the progress bars
/// while writing, so log lines don't tear them.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn output(status: WorkStatus, page_count: usize, ocr_page_count: usize) -> WorkOutput<DocumentOutput> {
        WorkOutput {
            id: json!("acme_property"),
            status,
            token_usage: None,
            errors: vec![],
            data: DocumentOutput {
                page_count,
                ocr_page_count,
                ..DocumentOutput::default()
            },
        }
    }

    #[test]
    fn progress_tallies_pages_and_statuses() {
        let ui = Ui::init_for_tests();
        let progress = ui.reconcile_progress(Some(3));
        progress.record(&output(WorkStatus::Ok, 4, 1));
        progress.record(&output(WorkStatus::Incomplete, 3, 3));
        progress.record(&output(WorkStatus::Failed, 0, 0));
        assert_eq!(
            progress.tally(),
            PageTally {
                pages: 7,
                ocr_pages: 4,
                degraded_documents: 1,
                failed_documents: 1,
            }
        );
        assert_eq!(progress.tally().message(), "7 pages, 4 via OCR, 1 degraded, 1 failed");
        progress.finish();
    }

    #[test]
    fn clean_runs_have_short_messages() {
        let ui = Ui::init_for_tests();
        let progress = ui.reconcile_progress(None);
        progress.record(&output(WorkStatus::Ok, 2, 0));
        assert_eq!(progress.tally().message(), "2 pages, 0 via OCR");
    }
}
