use std::{io::Write, path::PathBuf, sync::Arc};

use time::UtcOffset;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};

use crate::config::Config;
use crate::console;
use crate::error::SetupError;
use crate::record::{LogRecord, timestamp};
use crate::rolling::{RollingFile, RollingWriter};
use crate::severity::Severity;

/// Lines queued per writer thread before new ones are dropped.
const QUEUE_LINES: usize = 128_000;

fn spawn_writer<W: Write + Send + 'static>(name: &str, writer: W) -> (NonBlocking, WorkerGuard) {
    NonBlockingBuilder::default()
        .lossy(true)
        .buffered_lines_limit(QUEUE_LINES)
        .thread_name(name)
        .finish(writer)
}

/// File destination of one severity, optionally mirrored to the console.
///
/// Lines are handed to a dedicated writer thread; callers never wait for
/// the disk.
#[derive(Debug)]
struct Sink {
    severity: Severity,
    file: Arc<RollingFile>,
    writer: NonBlocking,
    echo: bool,
    _guard: WorkerGuard,
}

impl Sink {
    fn open(config: &Config, severity: Severity) -> Result<Self, SetupError> {
        let stem = format!("{}.{}", config.file_name(), severity.name());
        let file = RollingFile::open(config.output_dir(), stem, config.rotation().clone())
            .map_err(|source| SetupError::OpenSink {
                path: config.output_dir().to_path_buf(),
                source,
            })?;
        let file = Arc::new(file);
        let (writer, guard) = spawn_writer(
            &format!("flogger-{severity}"),
            RollingWriter(Arc::clone(&file)),
        );
        Ok(Sink {
            severity,
            file,
            writer,
            echo: config.console().enabled(severity),
            _guard: guard,
        })
    }
}

/// Owns one sink per severity and routes records to them.
#[derive(Debug)]
pub struct SinkManager {
    sinks: [Sink; 4],
    console: NonBlocking,
    offset: UtcOffset,
    _console_guard: WorkerGuard,
}

impl SinkManager {
    pub fn new(config: &Config) -> Result<Self, SetupError> {
        let [error, warn, info, verbose] = Severity::ALL.map(|s| Sink::open(config, s));
        let (console, console_guard) = spawn_writer("flogger-console", std::io::stdout());
        Ok(SinkManager {
            sinks: [error?, warn?, info?, verbose?],
            console,
            offset: config.offset(),
            _console_guard: console_guard,
        })
    }

    fn sink(&self, severity: Severity) -> &Sink {
        &self.sinks[severity.index()]
    }

    /// Stamps `record` and queues it as one JSON line for the file of
    /// `severity`, echoing it when console output is on for that severity.
    ///
    /// Returns once the line is queued. Failures are reported on stderr and
    /// the record is dropped.
    pub fn write(&self, severity: Severity, mut record: LogRecord) {
        record.timestamp = timestamp(self.offset);
        let sink = self.sink(severity);
        debug_assert_eq!(sink.severity, severity);

        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                console::report(&format!("cannot serialize {severity} record: {err}"));
                return;
            }
        };

        if sink.echo {
            let mut echoed = console::render(severity, &record.timestamp, &line);
            echoed.push('\n');
            // a full queue drops the echo, the file line is unaffected
            let _ = self.console.clone().write_all(echoed.as_bytes());
        }

        line.push('\n');
        if let Err(err) = sink.writer.clone().write_all(line.as_bytes()) {
            console::report(&format!("cannot queue {severity} record: {err}"));
        }
    }

    /// File currently written for `severity`.
    pub fn path(&self, severity: Severity) -> PathBuf {
        self.sink(severity).file.current_path()
    }

    pub fn echoes(&self, severity: Severity) -> bool {
        self.sink(severity).echo
    }

    /// Lines of `severity` dropped because its writer queue was full.
    pub fn dropped(&self, severity: Severity) -> usize {
        self.sink(severity).writer.error_counter().dropped_lines()
    }

    #[cfg(test)]
    pub(crate) fn hold(&self, severity: Severity) -> std::sync::MutexGuard<'_, crate::rolling::State> {
        self.sink(severity).file.hold()
    }
}
