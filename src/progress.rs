//! Terminal progress for the `wsync` CLI
//!
//! A spinner while the plan is hashed, then a file counter bar that the
//! transfer callback advances.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub struct SyncProgress {
    bar: ProgressBar,
    quiet: bool,
}

impl SyncProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { bar, quiet }
    }

    pub fn stage(&self, msg: &str) {
        self.bar.set_message(msg.to_string());
        if !self.quiet {
            self.bar.enable_steady_tick(Duration::from_millis(100));
        }
    }

    /// Callback for `ClientSession::synchronize`
    pub fn update(&self, done: u64, total: u64) {
        if self.bar.length() != Some(total) {
            self.bar.set_length(total);
            self.bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} Syncing [{bar:30.cyan/blue}] {pos}/{len} files {elapsed_precise}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
        }
        self.bar.set_position(done);
    }

    pub fn finish(&self, msg: &str) {
        self.bar.finish_and_clear();
        if !self.quiet {
            eprintln!("{}", msg);
        }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_bar_tracks_position() {
        let progress = SyncProgress::new(true);
        progress.stage("planning");
        progress.update(1, 4);
        progress.update(3, 4);
        assert_eq!(progress.bar().length(), Some(4));
        assert_eq!(progress.bar().position(), 3);
        progress.finish("done");
    }
}
