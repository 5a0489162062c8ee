use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use time::OffsetDateTime;

use crate::config::{Retention, RotationPolicy};
use crate::console;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Append-only file that rolls over when the date period changes or the
/// file grows past the size limit.
///
/// Files are named `{stem}-{period}.log`; size rotations within one period
/// add a counter: `{stem}-{period}.1.log`, `{stem}-{period}.2.log`, ...
#[derive(Debug)]
pub(crate) struct RollingFile {
    layout: Layout,
    state: Mutex<State>,
}

#[derive(Debug)]
struct Layout {
    dir: PathBuf,
    stem: String,
    policy: RotationPolicy,
}

#[derive(Debug)]
pub(crate) struct State {
    period: String,
    index: u32,
    path: PathBuf,
    size: u64,
    file: File,
}

impl RollingFile {
    pub(crate) fn open(dir: &Path, stem: String, policy: RotationPolicy) -> io::Result<Self> {
        let layout = Layout {
            dir: dir.to_path_buf(),
            stem,
            policy,
        };
        let period = layout.period(crate::record::now(layout.policy.offset))?;
        let state = layout.resume(period)?;
        let rolling = RollingFile {
            layout,
            state: Mutex::new(state),
        };
        rolling.prune();
        Ok(rolling)
    }

    /// Path of the file currently written to.
    pub(crate) fn current_path(&self) -> PathBuf {
        match self.state.lock() {
            Ok(state) => state.path.clone(),
            Err(poisoned) => poisoned.into_inner().path.clone(),
        }
    }

    /// Appends `line` with a single write while holding the file lock.
    pub(crate) fn write(&self, line: &[u8]) -> io::Result<()> {
        self.write_at(crate::record::now(self.layout.policy.offset), line)
    }

    pub(crate) fn write_at(&self, now: OffsetDateTime, line: &[u8]) -> io::Result<()> {
        let period = self.layout.period(now)?;
        let mut state = self
            .state
            .lock()
            .map_err(|e| io::Error::other(format!("log file lock poisoned: {e}")))?;
        let len = line.len() as u64;

        let mut rotated = false;
        if state.period != period {
            *state = self.layout.open_state(period, 0)?;
            rotated = true;
        } else if self
            .layout
            .policy
            .max_size
            .is_some_and(|max| state.size > 0 && state.size + len > max)
        {
            let (period, index) = (state.period.clone(), state.index + 1);
            *state = self.layout.open_state(period, index)?;
            rotated = true;
        } else if !state.path.exists() {
            // removed behind our back, start it again
            let (period, index) = (state.period.clone(), state.index);
            *state = self.layout.open_state(period, index)?;
        }

        state.file.write_all(line)?;
        state.size += len;
        drop(state);

        if rotated {
            self.prune();
        }
        Ok(())
    }

    /// Blocks every writer of this file until the guard is dropped.
    #[cfg(test)]
    pub(crate) fn hold(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Deletes files beyond the retention limit. Failures are only reported.
    fn prune(&self) {
        let dir = &self.layout.dir;
        let files = match self.layout.rotated_files(&self.current_path()) {
            Ok(files) => files,
            Err(err) => {
                console::report(&format!("cannot list log files in {}: {err}", dir.display()));
                return;
            }
        };

        let expired: Vec<&PathBuf> = match self.layout.policy.max_files {
            // the current file counts towards the limit
            Retention::Files(keep) => files
                .iter()
                .skip(keep.saturating_sub(1))
                .map(|(path, _)| path)
                .collect(),
            Retention::Days(days) => {
                let keep = DAY.saturating_mul(u32::try_from(days).unwrap_or(u32::MAX));
                let now = SystemTime::now();
                files
                    .iter()
                    .filter(|(_, modified)| now.duration_since(*modified).unwrap_or_default() > keep)
                    .map(|(path, _)| path)
                    .collect()
            }
        };

        for path in expired {
            match fs::remove_file(path) {
                Ok(()) => log::debug!("removed expired log file {}", path.display()),
                Err(err) => console::report(&format!(
                    "cannot remove expired log file {}: {err}",
                    path.display()
                )),
            }
        }
    }
}

/// `io::Write` end of a shared [`RollingFile`], driven by a background
/// writer thread. Every `write` call is one complete line.
#[derive(Debug, Clone)]
pub(crate) struct RollingWriter(pub(crate) Arc<RollingFile>);

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Err(err) = self.0.write(buf) {
            console::report(&format!(
                "cannot write record to {}: {err}",
                self.0.current_path().display()
            ));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Layout {
    fn period(&self, now: OffsetDateTime) -> io::Result<String> {
        now.format(&self.policy.date_format)
            .map_err(|e| io::Error::other(format!("cannot format date pattern: {e}")))
    }

    fn file_path(&self, period: &str, index: u32) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}-{}.log", self.stem, period))
        } else {
            self.dir.join(format!("{}-{}.{}.log", self.stem, period, index))
        }
    }

    /// Continues the newest file of `period` left by a previous run.
    fn resume(&self, period: String) -> io::Result<State> {
        let mut index = 0;
        while self.file_path(&period, index + 1).exists() {
            index += 1;
        }
        let state = self.open_state(period, index)?;
        match self.policy.max_size {
            Some(max) if state.size >= max => {
                let (period, index) = (state.period, state.index + 1);
                self.open_state(period, index)
            }
            _ => Ok(state),
        }
    }

    fn open_state(&self, period: String, index: u32) -> io::Result<State> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(&period, index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(State {
            period,
            index,
            path,
            size,
            file,
        })
    }

    /// Files of this sink other than `current`, newest first.
    fn rotated_files(&self, current: &Path) -> io::Result<Vec<(PathBuf, SystemTime)>> {
        let prefix = format!("{}-", self.stem);
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".log"));
            if !is_ours || path == current || !path.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            files.push((path, modified));
        }
        files.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Limit, Options};
    use time::macros::datetime;

    fn policy(max_size: Option<u64>, max_files: &str) -> RotationPolicy {
        let dir = tempfile::tempdir().unwrap();
        let mut options = Options::new().root(dir.path()).max_files(max_files);
        if let Some(size) = max_size {
            options = options.max_size(Limit::Number(size));
        }
        options.resolve().unwrap().rotation().clone()
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_rotates_on_period_change() {
        let dir = tempfile::tempdir().unwrap();
        let rolling =
            RollingFile::open(dir.path(), "app.info".to_string(), policy(None, "30d")).unwrap();

        rolling
            .write_at(datetime!(2024-03-05 23:59 UTC), b"first\n")
            .unwrap();
        rolling
            .write_at(datetime!(2024-03-06 00:01 UTC), b"second\n")
            .unwrap();

        assert_eq!(lines(&dir.path().join("app.info-2024-03-05.log")), vec!["first"]);
        assert_eq!(lines(&dir.path().join("app.info-2024-03-06.log")), vec!["second"]);
        assert_eq!(
            rolling.current_path(),
            dir.path().join("app.info-2024-03-06.log")
        );
    }

    #[test]
    fn test_writer_appends_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let rolling =
            RollingFile::open(dir.path(), "app.info".to_string(), policy(None, "30d")).unwrap();
        let mut writer = RollingWriter(Arc::new(rolling));
        writer.write_all(b"{\"n\":1}\n").unwrap();
        writer.write_all(b"{\"n\":2}\n").unwrap();
        assert_eq!(
            lines(&writer.0.current_path()),
            vec![r#"{"n":1}"#, r#"{"n":2}"#]
        );
    }

    #[test]
    fn test_rotates_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let rolling =
            RollingFile::open(dir.path(), "app.warn".to_string(), policy(Some(64), "30d")).unwrap();
        let at = datetime!(2024-03-05 10:00 UTC);
        let line = [b'x'; 39];

        for _ in 0..3 {
            let mut record = line.to_vec();
            record.push(b'\n');
            rolling.write_at(at, &record).unwrap();
        }

        for name in [
            "app.warn-2024-03-05.log",
            "app.warn-2024-03-05.1.log",
            "app.warn-2024-03-05.2.log",
        ] {
            assert_eq!(lines(&dir.path().join(name)).len(), 1, "{name}");
        }
    }

    #[test]
    fn test_resume_continues_latest_file() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(Some(1024), "30d");
        let period = crate::record::now(policy.offset)
            .format(&policy.date_format)
            .unwrap();
        fs::write(dir.path().join(format!("app.error-{period}.log")), b"old\n").unwrap();
        fs::write(dir.path().join(format!("app.error-{period}.1.log")), b"older\n").unwrap();

        let rolling = RollingFile::open(dir.path(), "app.error".to_string(), policy).unwrap();
        assert_eq!(
            rolling.current_path(),
            dir.path().join(format!("app.error-{period}.1.log"))
        );
    }

    #[test]
    fn test_keeps_file_count() {
        let dir = tempfile::tempdir().unwrap();
        let rolling =
            RollingFile::open(dir.path(), "app.verbose".to_string(), policy(Some(8), "2")).unwrap();
        let at = datetime!(2024-03-05 10:00 UTC);
        for _ in 0..4 {
            rolling.write_at(at, b"0123456\n").unwrap();
        }

        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.starts_with("app.verbose-"))
            .collect();
        assert_eq!(remaining.len(), 2, "{remaining:?}");
        assert!(rolling.current_path().exists());
    }

    #[test]
    fn test_removes_files_older_than_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("app.info-2000-01-01.log");
        let unrelated = dir.path().join("other-2000-01-01.log");
        for path in [&stale, &unrelated] {
            let file = File::create(path).unwrap();
            file.set_modified(SystemTime::now() - DAY * 40).unwrap();
        }

        let _rolling =
            RollingFile::open(dir.path(), "app.info".to_string(), policy(None, "30d")).unwrap();

        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_recreates_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let rolling =
            RollingFile::open(dir.path(), "app.info".to_string(), policy(None, "30d")).unwrap();
        let path = rolling.current_path();
        fs::remove_file(&path).unwrap();

        rolling.write(b"again\n").unwrap();
        assert_eq!(lines(&path), vec!["again"]);
    }
}
