//! Console output: colored echo lines, logger problems on stderr.

use std::io::Write;

use owo_colors::{AnsiColors, OwoColorize};

use crate::severity::Severity;

/// `[2024-03-05 07:00:00][info] ✔ {"message":"..."}` in the severity color.
pub(crate) fn render(severity: Severity, timestamp: &str, line: &str) -> String {
    let descriptor = severity.descriptor();
    format!(
        "[{timestamp}][{}] {} {}",
        descriptor.name,
        descriptor.icon,
        line.color(descriptor.color)
    )
}

/// Reports a problem of the logger itself. Never fails.
pub(crate) fn report(message: &str) {
    log::warn!("{message}");
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", message.color(AnsiColors::Red));
}
