//! Terminal rendering of sync progress.

use indicatif::{ProgressBar, ProgressStyle};

use projsync_core::models::{Progress, ProgressSink, SyncPhase};

/// Spinner that follows phase changes and switches to a bar while a phase
/// reports counted progress.
pub struct SpinnerSink {
    bar: ProgressBar,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl SpinnerSink {
    pub fn new() -> Self {
        let spinner_style = ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        let bar_style =
            ProgressStyle::with_template("{spinner:.blue} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> ");

        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style.clone());
        bar.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            bar,
            spinner_style,
            bar_style,
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for SpinnerSink {
    fn report(&self, phase: SyncPhase, progress: Option<&Progress>) {
        match progress {
            Some(p) if p.total > 0 => {
                self.bar.set_style(self.bar_style.clone());
                self.bar.set_length(p.total);
                self.bar.set_position(p.current.min(p.total));
                self.bar.set_message(format!("{}: {}", phase_label(phase), p.description));
            }
            _ => {
                self.bar.set_style(self.spinner_style.clone());
                self.bar.set_message(format!("{}...", phase_label(phase)));
            }
        }
    }
}

fn phase_label(phase: SyncPhase) -> &'static str {
    match phase {
        SyncPhase::Idle => "Idle",
        SyncPhase::LockAcquired => "Lock acquired",
        SyncPhase::Committing => "Committing local changes",
        SyncPhase::Fetching => "Fetching",
        SyncPhase::FastForwardAttempt => "Fast-forwarding",
        SyncPhase::Pushing => "Pushing",
        SyncPhase::Reconciling => "Reconciling",
        SyncPhase::Merging => "Merging",
        SyncPhase::LockReleased => "Done",
    }
}
