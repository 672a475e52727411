use std::fmt::Display;

use kestrel_observability::RunStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Category of a task body failure.
///
/// Tasks declare which of these they consider normal outcomes through
/// [`ExpectedFailures`]; that only affects metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    NotFound,
    PermissionDenied,
    Conflict,
    QuotaExceeded,
    Timeout,
    Unavailable,
    Internal,
}

impl FailureKind {
    pub const ALL: [FailureKind; 8] = [
        FailureKind::InvalidInput,
        FailureKind::NotFound,
        FailureKind::PermissionDenied,
        FailureKind::Conflict,
        FailureKind::QuotaExceeded,
        FailureKind::Timeout,
        FailureKind::Unavailable,
        FailureKind::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::NotFound => "not_found",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::Conflict => "conflict",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Internal => "internal",
        }
    }

    const fn bit(self) -> u16 {
        match self {
            FailureKind::InvalidInput => 1 << 0,
            FailureKind::NotFound => 1 << 1,
            FailureKind::PermissionDenied => 1 << 2,
            FailureKind::Conflict => 1 << 3,
            FailureKind::QuotaExceeded => 1 << 4,
            FailureKind::Timeout => 1 << 5,
            FailureKind::Unavailable => 1 << 6,
            FailureKind::Internal => 1 << 7,
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of failure kinds a task declares as anticipated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExpectedFailures(u16);

impl ExpectedFailures {
    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn of(kinds: &[FailureKind]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < kinds.len() {
            bits |= kinds[i].bit();
            i += 1;
        }
        Self(bits)
    }

    #[must_use]
    pub const fn with(self, kind: FailureKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub const fn contains(&self, kind: FailureKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = FailureKind> + '_ {
        FailureKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
    }

    /// Metric status for a failed run.
    pub fn classify(&self, error: &TaskError) -> RunStatus {
        if self.contains(error.kind()) {
            RunStatus::ExpectedError
        } else {
            RunStatus::Error
        }
    }
}

impl FromIterator<FailureKind> for ExpectedFailures {
    fn from_iter<I: IntoIterator<Item = FailureKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

/// Failure raised by a task body.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    kind: FailureKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl TaskError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: FailureKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(FailureKind::InvalidInput, "malformed task arguments", err)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn expected_set_membership() {
        let expected = ExpectedFailures::of(&[FailureKind::NotFound, FailureKind::QuotaExceeded]);

        assert!(expected.contains(FailureKind::NotFound));
        assert!(expected.contains(FailureKind::QuotaExceeded));
        assert!(!expected.contains(FailureKind::Internal));
        assert_eq!(
            expected.iter().collect::<Vec<_>>(),
            vec![FailureKind::NotFound, FailureKind::QuotaExceeded]
        );
        assert!(ExpectedFailures::none().is_empty());
    }

    #[test]
    fn classify_expected_and_unexpected() {
        let expected: ExpectedFailures = [FailureKind::Conflict].into_iter().collect();

        assert_eq!(
            expected.classify(&TaskError::new(FailureKind::Conflict, "seat taken")),
            RunStatus::ExpectedError
        );
        assert_eq!(
            expected.classify(&TaskError::internal("boom")),
            RunStatus::Error
        );
        assert_eq!(
            ExpectedFailures::none().classify(&TaskError::new(FailureKind::Conflict, "seat taken")),
            RunStatus::Error
        );
    }

    #[test]
    fn every_kind_has_a_distinct_bit() {
        let all: ExpectedFailures = FailureKind::ALL.into_iter().collect();
        assert_eq!(all.iter().count(), FailureKind::ALL.len());
    }

    #[test]
    fn json_errors_are_invalid_input() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = TaskError::from(json_err);

        assert_eq!(err.kind(), FailureKind::InvalidInput);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "invalid_input: malformed task arguments");
    }
}
