//! Helpers shared by the unit tests.

use std::{
    fs,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use crate::facade::FileLogger;
use crate::record::LogRecord;
use crate::severity::Severity;

/// Complete records in `path` once at least `count` are there, or whatever
/// arrived within five seconds.
pub(crate) fn read_records(path: &Path, count: usize) -> Vec<LogRecord> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let content = fs::read_to_string(path).unwrap_or_default();
        let complete = &content[..content.rfind('\n').map_or(0, |i| i + 1)];
        if complete.lines().count() >= count || Instant::now() >= deadline {
            return complete
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect();
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub(crate) fn records(logger: &FileLogger, severity: Severity, count: usize) -> Vec<LogRecord> {
    read_records(&logger.path(severity), count)
}
