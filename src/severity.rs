use std::{fmt, str::FromStr};

use owo_colors::AnsiColors;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Log level a record is routed by. Every severity owns exactly one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warn,
    Info,
    Verbose,
}

/// Display metadata of a [`Severity`].
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub name: &'static str,
    pub color: AnsiColors,
    pub icon: &'static str,
}

impl Severity {
    /// All severities in registry order.
    pub const ALL: [Severity; 4] = [
        Severity::Error,
        Severity::Warn,
        Severity::Info,
        Severity::Verbose,
    ];

    /// Severity of records emitted for completed requests.
    pub const ACCESS: Severity = Severity::Verbose;

    /// Severity of records emitted for failed requests.
    pub const FAILURE: Severity = Severity::Error;

    pub fn descriptor(self) -> Descriptor {
        match self {
            Severity::Error => Descriptor {
                name: "error",
                color: AnsiColors::Red,
                icon: "✖",
            },
            Severity::Warn => Descriptor {
                name: "warn",
                color: AnsiColors::Yellow,
                icon: "✎",
            },
            Severity::Info => Descriptor {
                name: "info",
                color: AnsiColors::Green,
                icon: "✔",
            },
            Severity::Verbose => Descriptor {
                name: "verbose",
                color: AnsiColors::Cyan,
                icon: "✈",
            },
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Position in [`Severity::ALL`], used to index per-severity tables.
    pub(crate) fn index(self) -> usize {
        match self {
            Severity::Error => 0,
            Severity::Warn => 1,
            Severity::Info => 2,
            Severity::Verbose => 3,
        }
    }

    /// Looks a severity up by its name, ignoring ASCII case.
    pub fn find(name: &str) -> Option<Severity> {
        Severity::ALL
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown severity `{0}`")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::find(s).ok_or_else(|| UnknownSeverity(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_and_index() {
        for (i, severity) in Severity::ALL.into_iter().enumerate() {
            assert_eq!(severity.index(), i);
        }
        assert_eq!(Severity::ACCESS, Severity::Verbose);
        assert_eq!(Severity::FAILURE, Severity::Error);
    }

    #[test]
    fn test_find() {
        assert_eq!(Severity::find("warn"), Some(Severity::Warn));
        assert_eq!(Severity::find("INFO"), Some(Severity::Info));
        assert_eq!(Severity::find("access"), None);
        assert_eq!("verbose".parse::<Severity>(), Ok(Severity::Verbose));
        let err = "debug".parse::<Severity>().unwrap_err();
        assert_eq!(err, UnknownSeverity("debug".to_string()));
        assert_eq!(err.to_string(), "unknown severity `debug`");
    }

    #[test]
    fn test_descriptors() {
        let error = Severity::Error.descriptor();
        assert_eq!(error.name, "error");
        assert_eq!(error.icon, "✖");
        assert!(matches!(error.color, AnsiColors::Red));
        assert!(matches!(Severity::Verbose.descriptor().color, AnsiColors::Cyan));
        assert_eq!(Severity::Info.to_string(), "info");
    }
}
