//! Progress bars and summary reporting for CLI transfers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::catalog::RemoteFileEntry;
use crate::error::TransferError;
use crate::format::{format_bytes, format_duration, format_eta, format_speed};
use crate::stats::{BatchSummary, TransferStats};
use crate::transfer::{TransferProgress, TransferRequest, TransferSnapshot};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╌")
}

/// Creates the bar for the file currently being transferred.
fn make_progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(bar_style(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    ));
    bar
}

/// Creates the bar for overall batch progress.
fn make_total_progress_bar(size: u64) -> ProgressBar {
    let bar = ProgressBar::new(size);
    bar.set_style(bar_style("Total [{bar:40.green/white}] {bytes}/{total_bytes}"));
    bar
}

/// Renders engine callbacks as indicatif bars.
///
/// Transfers run one at a time, so a single file bar is reused.
pub struct CliProgress {
    multi: MultiProgress,
    file_bar: ProgressBar,
    total_bar: Option<ProgressBar>,
    done_bytes: AtomicU64,
}

impl CliProgress {
    /// Creates the bars; `total_bytes` adds an overall bar for batches.
    #[must_use]
    pub fn new(total_bytes: Option<u64>) -> Self {
        let multi = MultiProgress::new();
        let file_bar = multi.add(make_progress_bar());
        file_bar.enable_steady_tick(Duration::from_millis(250));
        let total_bar = total_bytes.map(|size| multi.add(make_total_progress_bar(size)));
        Self {
            multi,
            file_bar,
            total_bar,
            done_bytes: AtomicU64::new(0),
        }
    }

    /// Removes the bars from the terminal.
    pub fn finish(&self) {
        self.file_bar.finish_and_clear();
        if let Some(total) = &self.total_bar {
            total.finish_and_clear();
        }
        self.multi.clear().ok();
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }
}

impl TransferProgress for CliProgress {
    fn on_transfer_start(&self, request: &TransferRequest) {
        self.file_bar.reset();
        self.file_bar.set_length(request.entry.size);
        self.file_bar.set_message(request.entry.name.clone());
    }

    fn on_progress(&self, request: &TransferRequest, snapshot: &TransferSnapshot) {
        self.file_bar.set_position(snapshot.bytes_transferred);
        self.file_bar.set_message(format!(
            "@ {} ETA {} - {}",
            format_speed(snapshot.speed_bytes_per_sec),
            format_eta(snapshot.eta),
            request.entry.name
        ));
        if let Some(total) = &self.total_bar {
            total.set_position(self.done_bytes.load(Ordering::Relaxed) + snapshot.bytes_transferred);
        }
    }

    fn on_transfer_complete(&self, request: &TransferRequest, stats: &TransferStats) {
        self.done_bytes.fetch_add(stats.bytes, Ordering::Relaxed);
        self.println(format!(
            "  {} {} - {} in {} ({} avg, {} peak)",
            style("✓").green(),
            request.entry.name,
            format_bytes(stats.bytes),
            format_duration(stats.elapsed),
            format_speed(stats.average_speed),
            format_speed(stats.peak_speed),
        ));
    }

    fn on_transfer_cancelled(&self, request: &TransferRequest) {
        self.println(format!(
            "  {} {} - cancelled",
            style("✗").yellow(),
            request.entry.name
        ));
    }

    fn on_transfer_failed(&self, request: &TransferRequest, error: &TransferError) {
        self.println(format!(
            "  {} {} - {}",
            style("✗").red(),
            request.entry.name,
            error
        ));
    }
}

/// Prints search results.
pub fn print_file_list(platform: &str, files: &[RemoteFileEntry]) {
    if files.is_empty() {
        println!("No matching files in {platform}.");
        return;
    }

    let total_size: u64 = files.iter().map(|f| f.size).sum();

    println!("\n{SEPARATOR}");
    println!("{platform}:");
    println!("{SEPARATOR}");
    for file in files {
        println!("  {} ({})", file.name, format_bytes(file.size));
    }
    println!("{SEPARATOR}");
    println!("  {} file(s), {} total", files.len(), format_bytes(total_size));
    println!("{SEPARATOR}\n");
}

/// Prints a summary of a finished batch.
pub fn print_summary(summary: &BatchSummary) {
    if summary.total() == 0 {
        return;
    }

    println!("\n{SEPARATOR}");
    println!("Download Summary");
    println!("{SEPARATOR}");

    if summary.completed > 0 {
        println!("  Files downloaded:  {}", summary.completed);
        println!("  Total size:        {}", format_bytes(summary.total_bytes));
        println!("  Total time:        {}", format_duration(summary.elapsed));
        println!("  Average speed:     {}", format_speed(summary.average_speed()));
        println!("  Peak speed:        {}", format_speed(summary.peak_speed));
    }
    if summary.failed > 0 {
        println!("  Files failed:      {}", style(summary.failed).red());
    }
    if summary.cancelled > 0 {
        println!("  Files cancelled:   {}", style(summary.cancelled).yellow());
    }

    println!("{SEPARATOR}");
}
