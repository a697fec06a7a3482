//! Progress reporting for TTY and non-TTY environments.
//!
//! TTY mode: one indicatif count bar per job (clear on completion).
//! Non-TTY mode: log-based output (no progress bars).

use std::io::IsTerminal;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Per-job count bar (green bar, items done/total, ETA)
fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:<20.dim} {bar:30.green/dim} {human_pos:>7}/{human_len:7} {eta:>4} {wide_msg:.dim}")
        .expect("invalid template")
        .progress_chars("--")
}

/// Count style for jobs whose total is unknown (paginated listings)
fn counter_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:<20.dim} {human_pos:>7} done {per_sec:.dim} {wide_msg:.dim}")
        .expect("invalid template")
}

/// Central progress context managing multi-progress bars.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Create new context, detecting TTY automatically.
    pub fn new() -> Self {
        let is_tty = std::io::stderr().is_terminal();
        Self {
            multi: MultiProgress::new(),
            is_tty,
        }
    }

    /// Create a per-job count bar.
    ///
    /// TTY: visible bar, or a plain counter when `total` is unknown.
    /// Non-TTY: hidden (no-op); the job summary is logged instead.
    pub fn job_bar(&self, name: &str, total: Option<u64>) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }

        let pb = match total {
            Some(n) => {
                let pb = self.multi.add(ProgressBar::new(n));
                pb.set_style(bar_style());
                pb
            }
            None => {
                let pb = self.multi.add(ProgressBar::no_length());
                pb.set_style(counter_style());
                pb
            }
        };
        // Truncate long names to keep bars aligned
        let display: String = name.chars().take(20).collect();
        pb.set_prefix(display);
        pb
    }

    /// Whether running in TTY mode.
    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// Get reference to `MultiProgress` for log bridge.
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Decimal with `,` between groups of three digits.
pub fn fmt_num(n: usize) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_bar_hidden_off_tty() {
        let ctx = ProgressContext {
            multi: MultiProgress::new(),
            is_tty: false,
        };
        assert!(ctx.job_bar("pubchem", Some(10)).is_hidden());
        assert!(ctx.job_bar("chemrxiv-gather", None).is_hidden());
    }

    #[test]
    fn fmt_num_groups_thousands() {
        assert_eq!(fmt_num(0), "0");
        assert_eq!(fmt_num(999), "999");
        assert_eq!(fmt_num(50_000), "50,000");
        assert_eq!(fmt_num(1_234_567), "1,234,567");
    }
}
