//! Scoped progress reporting for pipeline stages
//!
//! A `ProgressScope` wraps one `indicatif` bar for a named stage and
//! finishes it on drop, so a stage that returns early (including via `?`)
//! still reports where it stopped.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter for one stage; side effect only, no state mutation
pub struct ProgressScope {
    bar: ProgressBar,
    stage: String,
}

impl ProgressScope {
    pub fn new(total: u64, stage: &str) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .expect("static progress template is valid")
                .progress_chars("##-"),
        );
        bar.set_message(stage.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            stage: stage.to_string(),
        }
    }

    /// A scope that draws nothing; used by `status` and tests
    pub fn hidden(total: u64, stage: &str) -> Self {
        Self {
            bar: ProgressBar::hidden().with_style(ProgressStyle::default_bar()),
            stage: stage.to_string(),
        }
        .with_length(total)
    }

    fn with_length(self, total: u64) -> Self {
        self.bar.set_length(total);
        self
    }

    pub fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Drop for ProgressScope {
    fn drop(&mut self) {
        let finished = self.bar.position() >= self.bar.length().unwrap_or(0);
        if finished {
            self.bar.finish_with_message(format!("{} complete", self.stage));
        } else {
            self.bar
                .abandon_with_message(format!("{} stopped", self.stage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_track_position() {
        let scope = ProgressScope::hidden(3, "Mapping");
        scope.inc(1);
        scope.inc(2);
        assert_eq!(scope.position(), 3);
    }

    #[test]
    fn drop_on_partial_progress_does_not_panic() {
        let scope = ProgressScope::hidden(5, "Reducing");
        scope.inc(2);
        drop(scope);
    }
}
