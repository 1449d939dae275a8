// pixfetch/src/ui.rs
//! Progress bars for in-flight fetches.
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use pixfetch_common::FetchProgress;

const BAR_TEMPLATE: &str =
    "{spinner:.blue} {prefix:<40.cyan.bold} {wide_bar:.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}) {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.blue} {prefix:<40.cyan.bold} {bytes} ({bytes_per_sec}) {msg}";
const PREFIX_WIDTH: usize = 40;

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .progress_chars("█▓▒░  ")
}

/// Spinner for a transfer of unknown size; becomes a bar once a total is known.
pub fn transfer_bar(label: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(style(SPINNER_TEMPLATE));
    pb.set_prefix(shorten(label, PREFIX_WIDTH));
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn apply_progress(pb: &ProgressBar, progress: FetchProgress) {
    if let Some(total) = progress.total {
        if pb.length() != Some(total) {
            pb.set_style(style(BAR_TEMPLATE));
            pb.set_length(total);
        }
    }
    pb.set_position(progress.completed);
}

/// Keeps the tail of `label`, which is usually the file name.
pub fn shorten(label: &str, width: usize) -> String {
    let count = label.chars().count();
    if count <= width {
        return label.to_string();
    }
    let tail: String = label.chars().skip(count - (width - 1)).collect();
    format!("…{tail}")
}

#[cfg(test)]
mod tests {
    use indicatif::ProgressDrawTarget;

    use super::*;

    #[test]
    fn shorten_keeps_short_labels() {
        assert_eq!(shorten("https://a/b.png", 40), "https://a/b.png");
    }

    #[test]
    fn shorten_keeps_the_tail() {
        let label = "https://images.example.com/some/deep/path/to/picture.png";
        let short = shorten(label, 20);
        assert_eq!(short.chars().count(), 20);
        assert!(short.ends_with("picture.png"));
        assert!(short.starts_with('…'));
    }

    #[test]
    fn bar_switches_to_known_length() {
        let pb = ProgressBar::new_spinner();
        pb.set_draw_target(ProgressDrawTarget::hidden());
        apply_progress(&pb, FetchProgress { completed: 10, total: None });
        assert_eq!(pb.length(), None);
        apply_progress(&pb, FetchProgress { completed: 20, total: Some(100) });
        assert_eq!(pb.length(), Some(100));
        assert_eq!(pb.position(), 20);
    }
}
