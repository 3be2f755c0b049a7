//! Blocking wrappers around external commands.
//!
//! Every destructive step in a conversion goes through an external tool
//! (`lvm`, `cryptsetup`, `sfdisk`, ...). These helpers run them quietly,
//! echo the command line in debug mode, and turn a nonzero exit status
//! into an error carrying the stderr tail.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

static DEBUG: AtomicBool = AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

fn render(argv: &[&str]) -> String {
    argv.join(" ")
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(10);
    lines[start..].join("\n")
}

/// Run a command, discarding its output unless it fails.
pub fn quiet_call(argv: &[&str]) -> Result<()> {
    if debug_enabled() {
        eprintln!("+ {}", render(argv));
    }

    let output = Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("spawning `{}`", argv[0]))?;

    if !output.status.success() {
        anyhow::bail!(
            "`{}` failed with {}\n{}",
            render(argv),
            output.status,
            stderr_tail(&output.stderr)
        );
    }
    Ok(())
}

/// Run a command with the given bytes on stdin. Used for device-mapper
/// tables and sfdisk scripts.
pub fn quiet_call_with_input(argv: &[&str], input: &str) -> Result<()> {
    if debug_enabled() {
        eprintln!("+ {} <<EOF\n{}EOF", render(argv), input);
    }

    let mut child = Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning `{}`", argv[0]))?;

    child
        .stdin
        .take()
        .expect("stdin was piped")
        .write_all(input.as_bytes())
        .with_context(|| format!("writing stdin of `{}`", argv[0]))?;

    let output = child
        .wait_with_output()
        .with_context(|| format!("waiting for `{}`", argv[0]))?;

    if !output.status.success() {
        anyhow::bail!(
            "`{}` failed with {}\n{}",
            render(argv),
            output.status,
            stderr_tail(&output.stderr)
        );
    }
    Ok(())
}

/// Run a command with inherited stdio. For tools that legitimately talk
/// to the user, like cryptsetup prompting for a passphrase.
pub fn interactive_call(argv: &[&str]) -> Result<()> {
    if debug_enabled() {
        eprintln!("+ {}", render(argv));
    }

    let status = Command::new(argv[0])
        .args(&argv[1..])
        .status()
        .with_context(|| format!("spawning `{}`", argv[0]))?;

    if !status.success() {
        anyhow::bail!("`{}` failed with {}", render(argv), status);
    }
    Ok(())
}

/// Run a command and return its trimmed stdout.
pub fn output_of(argv: &[&str]) -> Result<String> {
    if debug_enabled() {
        eprintln!("+ {}", render(argv));
    }

    let output = Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("spawning `{}`", argv[0]))?;

    if !output.status.success() {
        anyhow::bail!(
            "`{}` failed with {}\n{}",
            render(argv),
            output.status,
            stderr_tail(&output.stderr)
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Like [`output_of`], but the given exit code maps to `Ok(None)`.
/// blkid exits with 2 when no superblock is recognised, which is an
/// answer rather than a failure.
pub fn output_or_absent(argv: &[&str], absent_code: i32) -> Result<Option<String>> {
    if debug_enabled() {
        eprintln!("+ {}", render(argv));
    }

    let output = Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("spawning `{}`", argv[0]))?;

    if output.status.code() == Some(absent_code) {
        return Ok(None);
    }
    if !output.status.success() {
        anyhow::bail!(
            "`{}` failed with {}\n{}",
            render(argv),
            output.status,
            stderr_tail(&output.stderr)
        );
    }

    Ok(Some(
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_of_captures_stdout() {
        assert_eq!(output_of(&["echo", "hello"]).unwrap(), "hello");
    }

    #[test]
    fn quiet_call_reports_failure() {
        let err = quiet_call(&["false"]).unwrap_err();
        assert!(err.to_string().contains("`false` failed"));
    }

    #[test]
    fn absent_code_is_not_an_error() {
        let out = output_or_absent(&["sh", "-c", "exit 2"], 2).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn input_is_fed_to_stdin() {
        quiet_call_with_input(&["sh", "-c", "grep -q needle"], "needle\n").unwrap();
    }
}
