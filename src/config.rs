use std::{
    borrow::Cow,
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use time::UtcOffset;
use time::format_description::{self, OwnedFormatItem};

use crate::console;
use crate::error::SetupError;
use crate::record::ExcludeFilter;
use crate::severity::Severity;

/// Root used on deployment hosts.
pub const SERVE_ROOT: &str = "/data/logs";
/// Root used on developer machines and as the fallback destination.
pub const LOCAL_ROOT: &str = "logs";

const DEFAULT_NAME: &str = "app";
const DEFAULT_DATE_PATTERN: &str = "[year]-[month]-[day]";
const DEFAULT_MAX_SIZE: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_DAYS: u64 = 30;
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Deployment environment the logger runs in.
///
/// `Development` and `Production` are deployment environments: logs go to
/// [`SERVE_ROOT`] and nothing is echoed to the console. Anything else is a
/// local run with console echo enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Environment {
    Development,
    Production,
    #[default]
    Other,
}

impl From<String> for Environment {
    fn from(name: String) -> Self {
        Environment::from_name(&name)
    }
}

impl Environment {
    /// Maps a conventional environment name (`"production"`, `"development"`)
    /// to an [`Environment`]. Unknown names are [`Environment::Other`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            "production" | "prod" => Environment::Production,
            _ => Environment::Other,
        }
    }

    pub fn is_deployment(self) -> bool {
        matches!(self, Environment::Development | Environment::Production)
    }

    fn default_root(self) -> PathBuf {
        if self.is_deployment() {
            PathBuf::from(SERVE_ROOT)
        } else {
            PathBuf::from(LOCAL_ROOT)
        }
    }
}

/// A size or file-count limit, either numeric or textual (`"100m"`, `"30d"`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Limit {
    Number(u64),
    Text(String),
}

impl From<u64> for Limit {
    fn from(value: u64) -> Self {
        Limit::Number(value)
    }
}

impl From<&str> for Limit {
    fn from(value: &str) -> Self {
        Limit::Text(value.to_string())
    }
}

impl From<String> for Limit {
    fn from(value: String) -> Self {
        Limit::Text(value)
    }
}

/// How many rotated files a sink keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep at most this many files per sink.
    Files(usize),
    /// Delete files last modified more than this many days ago.
    Days(u64),
}

impl Retention {
    fn parse(limit: &Limit) -> Result<Self, SetupError> {
        match limit {
            Limit::Number(n) => Ok(Retention::Files(*n as usize)),
            Limit::Text(text) => {
                let trimmed = text.trim();
                let invalid = || SetupError::InvalidMaxFiles(text.clone());
                match trimmed.strip_suffix(['d', 'D']) {
                    Some(days) => days.parse().map(Retention::Days).map_err(|_| invalid()),
                    None => trimmed.parse().map(Retention::Files).map_err(|_| invalid()),
                }
            }
        }
    }
}

/// Parses a byte size: plain bytes or a number with a `k`, `m` or `g` suffix.
pub fn parse_size(limit: &Limit) -> Result<u64, SetupError> {
    let text = match limit {
        Limit::Number(n) => return Ok(*n),
        Limit::Text(text) => text,
    };
    let trimmed = text.trim().to_ascii_lowercase();
    let (digits, unit) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed.as_str(), 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(unit))
        .ok_or_else(|| SetupError::InvalidSize(text.clone()))
}

/// Accepts either a `time` format description (`[year]-[month]-[day]`) or the
/// moment-style tokens (`YYYY-MM-DD`) common in log rotation settings.
fn compile_date_pattern(pattern: &str) -> Result<OwnedFormatItem, SetupError> {
    let description = if pattern.contains('[') {
        Cow::Borrowed(pattern)
    } else {
        Cow::Owned(
            pattern
                .replace("YYYY", "[year]")
                .replace("MM", "[month]")
                .replace("DD", "[day]")
                .replace("HH", "[hour]")
                .replace("mm", "[minute]")
                .replace("ss", "[second]"),
        )
    };
    format_description::parse_owned::<2>(&description).map_err(|err| {
        SetupError::InvalidDatePattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        }
    })
}

/// Resolved rotation rules of every file sink.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub date_pattern: String,
    pub(crate) date_format: OwnedFormatItem,
    pub max_files: Retention,
    pub max_size: Option<u64>,
    /// Offset of the clock that decides the period of each file.
    pub offset: UtcOffset,
}

/// Rotation options as the user supplies them; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateOptions {
    pub date_pattern: Option<String>,
    pub max_files: Option<Limit>,
    pub max_size: Option<Limit>,
}

impl RotateOptions {
    fn resolve(self, offset: UtcOffset) -> Result<RotationPolicy, SetupError> {
        let date_pattern = self
            .date_pattern
            .unwrap_or_else(|| DEFAULT_DATE_PATTERN.to_string());
        let date_format = compile_date_pattern(&date_pattern)?;
        let max_files = match self.max_files {
            Some(limit) => Retention::parse(&limit)?,
            None => Retention::Days(DEFAULT_MAX_DAYS),
        };
        let max_size = match self.max_size {
            Some(limit) => Some(parse_size(&limit)?).filter(|size| *size > 0),
            None => Some(DEFAULT_MAX_SIZE),
        };
        Ok(RotationPolicy {
            date_pattern,
            date_format,
            max_files,
            max_size,
            offset,
        })
    }
}

/// Logger options. Unset fields take their defaults during [`Options::resolve`].
///
/// Deserializes from the camelCase option names used by log configuration
/// files:
///
/// ```rust
/// use actix_web_middleware_flogger::Options;
///
/// let options: Options = serde_json::from_str(r#"{
///     "appName": "shop",
///     "automate": true,
///     "dailyRotateFile": { "maxFiles": "14d", "maxSize": "20m" }
/// }"#).unwrap();
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    #[serde(alias = "applicationName")]
    pub app_name: Option<String>,
    pub file_name: Option<String>,
    #[serde(alias = "auto")]
    pub automate: Option<bool>,
    pub record_body: Option<bool>,
    pub max_body_bytes: Option<usize>,
    pub root: Option<PathBuf>,
    pub fallback_root: Option<PathBuf>,
    pub framework_bound: Option<bool>,
    pub environment: Option<Environment>,
    pub console: Option<bool>,
    #[serde(default)]
    pub echo: Vec<Severity>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub exclude_regex: Vec<String>,
    #[serde(default)]
    pub daily_rotate_file: RotateOptions,
    /// Clock offset of timestamps and file periods. Defaults to the local
    /// offset of the host.
    #[serde(skip)]
    pub utc_offset: Option<UtcOffset>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Log every completed request at [`Severity::ACCESS`].
    pub fn automate(mut self, enabled: bool) -> Self {
        self.automate = Some(enabled);
        self
    }

    /// Include the response body in access records.
    pub fn record_body(mut self, enabled: bool) -> Self {
        self.record_body = Some(enabled);
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = Some(limit);
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Root tried when the primary one cannot be created.
    pub fn fallback_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.fallback_root = Some(root.into());
        self
    }

    pub fn framework_bound(mut self, enabled: bool) -> Self {
        self.framework_bound = Some(enabled);
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Overrides the environment-derived console echo.
    pub fn console(mut self, enabled: bool) -> Self {
        self.console = Some(enabled);
        self
    }

    /// Always echo `severity` to the console, whatever the environment.
    pub fn echo(mut self, severity: Severity) -> Self {
        self.echo.push(severity);
        self
    }

    /// Do not log access records for this exact path.
    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        self.exclude.push(path.into());
        self
    }

    /// Do not log access records for URLs matching this pattern.
    pub fn exclude_regex(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_regex.push(pattern.into());
        self
    }

    pub fn date_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.daily_rotate_file.date_pattern = Some(pattern.into());
        self
    }

    pub fn max_files(mut self, limit: impl Into<Limit>) -> Self {
        self.daily_rotate_file.max_files = Some(limit.into());
        self
    }

    pub fn max_size(mut self, limit: impl Into<Limit>) -> Self {
        self.daily_rotate_file.max_size = Some(limit.into());
        self
    }

    pub fn utc_offset(mut self, offset: UtcOffset) -> Self {
        self.utc_offset = Some(offset);
        self
    }

    /// Merges the options over the defaults and prepares the output directory.
    ///
    /// If `{root}/{app_name}` cannot be created a warning is printed and
    /// `{fallback_root}/{app_name}` is used instead. Failing that too is fatal.
    pub fn resolve(self) -> Result<Config, SetupError> {
        let environment = self.environment.unwrap_or_default();
        let app_name = self.app_name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        let file_name = self.file_name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        let offset = self.utc_offset.unwrap_or_else(local_offset);
        let rotation = self.daily_rotate_file.resolve(offset)?;
        let exclude = ExcludeFilter::new(self.exclude, &self.exclude_regex)?;

        let root = self.root.unwrap_or_else(|| environment.default_root());
        let fallback_root = self
            .fallback_root
            .unwrap_or_else(|| PathBuf::from(LOCAL_ROOT));
        let (output_dir, fell_back) = ensure_output_dir(&root, &fallback_root, &app_name)?;

        let console = ConsoleEcho {
            all: self.console.unwrap_or(!environment.is_deployment()),
            forced: self.echo.into_iter().collect(),
        };

        log::debug!(
            "log output resolved to {} (environment: {:?})",
            output_dir.display(),
            environment
        );

        Ok(Config {
            app_name,
            file_name,
            output_dir,
            fell_back,
            automate: self.automate.unwrap_or(true),
            record_body: self.record_body.unwrap_or(false),
            max_body_bytes: self.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            rotation,
            framework_bound: self.framework_bound.unwrap_or(true),
            environment,
            console,
            exclude,
        })
    }
}

/// The local offset can only be read safely while the process is single
/// threaded, so it is looked up once here and reused by every write.
fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or_else(|err| {
        log::debug!("local offset unavailable ({err}), using UTC");
        UtcOffset::UTC
    })
}

fn ensure_output_dir(
    root: &Path,
    fallback_root: &Path,
    app_name: &str,
) -> Result<(PathBuf, bool), SetupError> {
    let primary = root.join(app_name);
    match fs::create_dir_all(&primary) {
        Ok(()) => Ok((primary, false)),
        Err(err) => {
            console::report(&format!(
                "Create '{}' directory is failure! ({err})",
                primary.display()
            ));
            let fallback = fallback_root.join(app_name);
            fs::create_dir_all(&fallback).map_err(|source| SetupError::CreateDir {
                path: fallback.clone(),
                source,
            })?;
            Ok((fallback, true))
        }
    }
}

/// Which severities are echoed to the console.
#[derive(Debug, Clone, Default)]
pub struct ConsoleEcho {
    all: bool,
    forced: HashSet<Severity>,
}

impl ConsoleEcho {
    pub fn enabled(&self, severity: Severity) -> bool {
        self.all || self.forced.contains(&severity)
    }
}

/// Logger configuration after merging [`Options`] over the defaults.
#[derive(Debug, Clone)]
pub struct Config {
    app_name: String,
    file_name: String,
    output_dir: PathBuf,
    fell_back: bool,
    automate: bool,
    record_body: bool,
    max_body_bytes: usize,
    rotation: RotationPolicy,
    framework_bound: bool,
    environment: Environment,
    console: ConsoleEcho,
    exclude: ExcludeFilter,
}

impl Config {
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Directory the severity files are written to.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Whether the primary root was unusable and the fallback root was taken.
    pub fn fell_back(&self) -> bool {
        self.fell_back
    }

    pub fn automate(&self) -> bool {
        self.automate
    }

    pub fn record_body(&self) -> bool {
        self.record_body
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn rotation(&self) -> &RotationPolicy {
        &self.rotation
    }

    pub fn framework_bound(&self) -> bool {
        self.framework_bound
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn console(&self) -> &ConsoleEcho {
        &self.console
    }

    pub fn exclude(&self) -> &ExcludeFilter {
        &self.exclude
    }

    /// Clock offset of timestamps and rotation periods.
    pub fn offset(&self) -> UtcOffset {
        self.rotation.offset
    }
}
