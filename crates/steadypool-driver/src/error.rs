//! Driver error taxonomy and the recoverability classifier.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for raw driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Category of a driver failure, mirroring the DB-API exception hierarchy.
///
/// Drivers tag every error they return with one of these kinds at the
/// boundary; the hardening layer decides recoverability from the tag alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Error in the driver interface itself rather than the database.
    Interface,
    /// Generic database error.
    Database,
    /// Problem with the processed data (division by zero, value out of range).
    Data,
    /// Lost connection, server restart, failed allocation on the server.
    Operational,
    /// Relational integrity violated.
    Integrity,
    /// Database internal state is invalid (cursor no longer valid, etc.).
    Internal,
    /// SQL syntax error, wrong number of parameters, missing table.
    Programming,
    /// Method or API not supported by the driver.
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Interface => "interface",
            ErrorKind::Database => "database",
            ErrorKind::Data => "data",
            ErrorKind::Operational => "operational",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Internal => "internal",
            ErrorKind::Programming => "programming",
            ErrorKind::NotSupported => "not supported",
        };
        f.write_str(name)
    }
}

/// An error reported by a raw connection or cursor.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct DriverError {
    kind: ErrorKind,
    message: String,
}

impl DriverError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn operational(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Operational, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn programming(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Programming, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The set of error kinds for which reopen-and-retry recovery is attempted.
///
/// Anything outside the set is fatal for the operation and propagates
/// immediately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ErrorKind>", into = "Vec<ErrorKind>")]
pub struct Failures(Vec<ErrorKind>);

impl Failures {
    /// Build a failure set. An empty list falls back to the default set,
    /// since recovery must always have a kind to force with.
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        let mut set: Vec<ErrorKind> = Vec::new();
        for kind in kinds {
            if !set.contains(&kind) {
                set.push(kind);
            }
        }
        if set.is_empty() {
            return Self::default();
        }
        Self(set)
    }

    /// Whether `error` should trigger recovery.
    pub fn is_recoverable(&self, error: &DriverError) -> bool {
        self.contains(error.kind())
    }

    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.0.contains(&kind)
    }

    /// The kind used when recovery has to be forced without a real failure,
    /// e.g. when a connection reaches its usage limit.
    pub fn primary(&self) -> ErrorKind {
        self.0.first().copied().unwrap_or(ErrorKind::Operational)
    }

    pub fn kinds(&self) -> &[ErrorKind] {
        &self.0
    }
}

impl From<Vec<ErrorKind>> for Failures {
    fn from(kinds: Vec<ErrorKind>) -> Self {
        Self::new(kinds)
    }
}

impl From<Failures> for Vec<ErrorKind> {
    fn from(failures: Failures) -> Self {
        failures.0
    }
}

impl Default for Failures {
    fn default() -> Self {
        Self(vec![ErrorKind::Operational, ErrorKind::Internal])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_failures_are_operational_and_internal() {
        let failures = Failures::default();
        assert!(failures.is_recoverable(&DriverError::operational("gone")));
        assert!(failures.is_recoverable(&DriverError::internal("bad cursor")));
        assert!(!failures.is_recoverable(&DriverError::programming("syntax")));
        assert_eq!(failures.primary(), ErrorKind::Operational);
    }

    #[test]
    fn custom_failures_dedup_and_keep_order() {
        let failures = Failures::new([
            ErrorKind::Interface,
            ErrorKind::Operational,
            ErrorKind::Interface,
        ]);
        assert_eq!(failures.kinds(), &[ErrorKind::Interface, ErrorKind::Operational]);
        assert_eq!(failures.primary(), ErrorKind::Interface);
        assert!(!failures.contains(ErrorKind::Internal));
    }

    #[test]
    fn empty_failures_fall_back_to_default() {
        assert_eq!(Failures::new(Vec::<ErrorKind>::new()), Failures::default());
    }

    #[test]
    fn driver_error_display() {
        let err = DriverError::operational("server closed the connection");
        assert_eq!(err.to_string(), "operational error: server closed the connection");
        assert_eq!(err.kind(), ErrorKind::Operational);
    }

    #[test]
    fn failures_parse_from_toml_list() {
        #[derive(Deserialize)]
        struct Doc {
            failures: Failures,
        }
        let doc: Doc = toml::from_str(r#"failures = ["operational", "interface"]"#).unwrap();
        assert_eq!(doc.failures.kinds(), &[ErrorKind::Operational, ErrorKind::Interface]);
    }
}
