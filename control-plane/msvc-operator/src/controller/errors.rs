use std::time::Duration;

use crate::controller::dependent::{Change, DependentKind};
use crate::templates::BuildError;

/// Severity buckets every failure is sorted into. Ordered from least to
/// most severe so an aggregate takes the `max` of its members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorClass {
    /// Optimistic-concurrency precondition failed or the view was stale.
    Conflict,
    /// Store unreachable, overloaded or timed out.
    Unavailable,
    /// The request can never succeed as written.
    Invalid,
    /// The controller lacks permission.
    Forbidden,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::Conflict | ErrorClass::Unavailable)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Conflict => write!(f, "conflict"),
            ErrorClass::Unavailable => write!(f, "unavailable"),
            ErrorClass::Invalid => write!(f, "invalid"),
            ErrorClass::Forbidden => write!(f, "forbidden"),
        }
    }
}

/// A store call failure, classified at the boundary.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("rejected: {0}")]
    Invalid(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            // Something vanished between read and write; a fresh read fixes it.
            StoreError::NotFound(_) | StoreError::Conflict(_) => {
                ErrorClass::Conflict
            }
            StoreError::Unavailable(_) => ErrorClass::Unavailable,
            StoreError::Invalid(_) => ErrorClass::Invalid,
            StoreError::Forbidden(_) => ErrorClass::Forbidden,
        }
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => {
                let msg = format!("{} ({})", ae.message, ae.reason);
                match ae.code {
                    404 => StoreError::NotFound(msg),
                    409 => StoreError::Conflict(msg),
                    401 | 403 => StoreError::Forbidden(msg),
                    400 | 405 | 413 | 415 | 422 => StoreError::Invalid(msg),
                    _ => StoreError::Unavailable(msg),
                }
            }
            kube::Error::SerdeError(e) => StoreError::Invalid(e.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// One dependent that could not be converged.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} {name}: {error}")]
pub struct DependentFailure {
    pub kind: DependentKind,
    pub name: String,
    pub error: StoreError,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum ReconcileErr {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid spec: {0}")]
    Build(#[from] BuildError),
    #[error("{}", join_failures(.failures))]
    Dependents {
        failures: Vec<DependentFailure>,
        /// Changes that did land before or alongside the failures.
        applied: Vec<Change>,
    },
    #[error("{kind} {name} is still terminating")]
    Terminating {
        kind: DependentKind,
        name: String,
        /// Removals that went through before the wait.
        applied: Vec<Change>,
    },
    #[error("reconcile exceeded {0:?}")]
    Timeout(Duration),
}

impl ReconcileErr {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileErr::Store(e) => e.class(),
            ReconcileErr::Build(_) => ErrorClass::Invalid,
            ReconcileErr::Dependents { failures, .. } => failures
                .iter()
                .map(|f| f.error.class())
                .max()
                .unwrap_or(ErrorClass::Unavailable),
            ReconcileErr::Terminating { .. } | ReconcileErr::Timeout(_) => {
                ErrorClass::Unavailable
            }
        }
    }

    pub fn applied(&self) -> &[Change] {
        match self {
            ReconcileErr::Dependents { applied, .. }
            | ReconcileErr::Terminating { applied, .. } => applied,
            _ => &[],
        }
    }
}

fn join_failures(failures: &[DependentFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
