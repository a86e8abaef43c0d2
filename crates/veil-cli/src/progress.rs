//! Send progress display.

use indicatif::{ProgressBar, ProgressStyle};

/// Progress of a bulk send
pub struct SendProgress {
    bar: ProgressBar,
}

impl SendProgress {
    /// Create a tracker for `total_bytes` going to `remote`
    ///
    /// # Errors
    ///
    /// Returns an error if the bar template is rejected.
    pub fn new(total_bytes: u64, remote: &str) -> anyhow::Result<Self> {
        let bar = ProgressBar::new(total_bytes);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
                .progress_chars("#>-"),
        );

        bar.set_message(format!("Sending to {remote}"));

        Ok(Self { bar })
    }

    /// Add sent bytes
    pub fn advance(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format a throughput figure (bytes/sec)
#[must_use]
pub fn format_speed(bytes: u64, secs: f64) -> String {
    if secs <= 0.0 {
        return "-".to_string();
    }
    format!("{}/s", format_bytes((bytes as f64 / secs) as u64))
}
