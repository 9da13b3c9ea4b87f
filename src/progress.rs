//! Progress reporting for dump, import and purge runs
//!
//! Provides real-time progress display using indicatif spinners and
//! styled end-of-run summaries.

use crate::walker::RunProgress;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter that displays run status
#[derive(Clone)]
pub struct ProgressReporter {
    bar: ProgressBar,

    /// Noun for processed items ("Read", "Written", "Deleted")
    verb: &'static str,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new(verb: &'static str) -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar, verb }
    }

    /// Update the progress display
    pub fn update(&self, progress: &RunProgress) {
        let msg = format!(
            "Found: {} | {}: {} | Failed: {} | Rate: {:.0}/s | Queue: {} | Workers: {}",
            format_number(progress.found),
            self.verb,
            format_number(progress.processed),
            format_number(progress.failed),
            progress.rate(),
            progress.queue_len,
            progress.workers,
        );

        self.bar.set_message(msg);
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print the banner at the start of a run
pub fn print_header(operation: &str, address: &str, workers: usize, target: &str) {
    eprintln!();
    eprintln!(
        "{} {}",
        style("vault-walker").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Operation:").bold(), operation);
    eprintln!("  {} {}", style("Vault:").bold(), address);
    eprintln!("  {} {}", style("Workers:").bold(), workers);
    eprintln!("  {} {}", style("Target:").bold(), target);
    eprintln!();
}

/// Print the purge warning banner
pub fn print_danger(address: &str, pause: Duration) {
    eprintln!();
    eprintln!("{}", style("*** DANGER ZONE ***").red().bold());
    eprintln!();
    eprintln!("This command will PERMANENTLY DELETE DATA from {}", style(address).bold());
    eprintln!();
    if !pause.is_zero() {
        eprintln!("Pausing for {} seconds...", pause.as_secs());
    }
}

/// Print the end-of-run summary
///
/// Summaries go to stderr so `dump -o stdout` output stays clean.
pub fn print_summary(title: &str, verb: &str, progress: &RunProgress, duration: Duration, output: Option<(&str, u64)>) {
    let secs = duration.as_secs_f64();
    let rate = if secs > 0.0 {
        progress.processed as f64 / secs
    } else {
        0.0
    };

    eprintln!();
    if progress.failed > 0 {
        eprintln!("{}", style(title).yellow().bold());
    } else {
        eprintln!("{}", style(title).green().bold());
    }
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Found:").bold(), format_number(progress.found));
    eprintln!("  {} {}", style(format!("{verb}:")).bold(), format_number(progress.processed));
    if progress.skipped > 0 {
        eprintln!("  {} {}", style("Skipped:").bold(), format_number(progress.skipped));
    }
    if progress.ignored > 0 {
        eprintln!("  {} {}", style("Ignored:").bold(), format_number(progress.ignored));
    }
    eprintln!(
        "  {} {:.1}s ({:.0}/sec)",
        style("Duration:").bold(),
        secs,
        rate
    );
    if progress.failed > 0 {
        eprintln!(
            "  {} {}",
            style("Failed:").yellow().bold(),
            format_number(progress.failed)
        );
    }
    if let Some((target, bytes)) = output {
        eprintln!(
            "  {} {} ({})",
            style("Output:").bold(),
            target,
            format_size(bytes, BINARY)
        );
    }
    eprintln!();
}
