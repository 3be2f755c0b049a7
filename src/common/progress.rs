//! User-facing progress reporting.
//!
//! Conversions report what they are about to do through a listener so the
//! same core works from the CLI (print and exit on fatal conditions) and
//! from library callers (return the error).

use anyhow::Error;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::common::errors::ConvertError;

pub trait ProgressListener {
    /// Informational message about the next step.
    fn notify(&self, msg: &str);

    /// Fatal condition. Returns the error to propagate; the CLI
    /// implementation does not return.
    fn bail(&self, msg: &str, err: ConvertError) -> Error;
}

/// Prints notifications and exits the process with status 2 on fatal
/// conditions.
pub struct CliProgress;

impl ProgressListener for CliProgress {
    fn notify(&self, msg: &str) {
        println!("{msg}");
    }

    fn bail(&self, msg: &str, _err: ConvertError) -> Error {
        eprintln!("{}", msg.red());
        std::process::exit(2);
    }
}

/// Returns errors to the caller instead of exiting.
#[cfg(test)]
pub struct QuietProgress;

#[cfg(test)]
impl ProgressListener for QuietProgress {
    fn notify(&self, _msg: &str) {}

    fn bail(&self, _msg: &str, err: ConvertError) -> Error {
        err.into()
    }
}

/// Spinner for steps that can take a while (filesystem checks, resizes).
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .expect("static template"),
    );
    pb.set_message(message.into());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

pub fn finish_spinner(pb: ProgressBar, message: impl Into<String>) {
    pb.finish_and_clear();
    println!("{} {}", "✓".green(), message.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_bail_returns_the_error() {
        let progress = QuietProgress;
        let err = progress.bail(
            "nope",
            ConvertError::UnsupportedLayout("logical partition".into()),
        );
        let kind = err.downcast_ref::<ConvertError>().unwrap();
        assert!(matches!(kind, ConvertError::UnsupportedLayout(_)));
    }
}
