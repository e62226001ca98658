use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const TEMPLATE: &str =
    "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})";

/// Progress bar in the CLI's house style, hidden when `enabled` is false.
pub(crate) struct ProgressTracker {
    progress_bar: ProgressBar,
}

impl ProgressTracker {
    pub(crate) fn new(len: usize, message: &str, enabled: bool) -> Self {
        let progress_bar = ProgressBar::new(len as u64);
        if !enabled {
            progress_bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        let style = ProgressStyle::with_template(TEMPLATE)
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        progress_bar.set_style(style);
        progress_bar.set_message(message.to_string());

        Self { progress_bar }
    }

    pub(crate) fn inc(&self) {
        self.progress_bar.inc(1);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish_and_clear();
    }
}
