//! Error types for engine operations.

use crate::permission::PermissionKind;
use crate::{ActionName, NodeId, TreeId, UserId};
use std::fmt;
use thiserror::Error;

/// Reason codes for topology-mutation validation failures.
///
/// Each code is attached to the input field that caused it; a single
/// [`ValidationError`] may carry several of these at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationCode {
    /// The addressed tree definition does not exist.
    UnknownTree,
    /// The element's underlying record does not exist.
    UnknownRecord,
    /// The given parent node does not exist in the tree.
    UnknownParent,
    /// The element's library is not declared in the tree at all.
    UnknownElement,
    /// The addressed node does not exist in the tree.
    UnknownNode,
    /// The element's library is not allowed under the resolved parent.
    LibraryForbiddenAsChild,
    /// The element already occupies a position and multiple positions are off.
    ElementAlreadyPresent,
    /// The destination ancestor chain already contains the element.
    ElementAlreadyPresentInAncestors,
    /// The tree is flagged `system` and cannot be deleted.
    SystemTree,
}

impl ValidationCode {
    /// Stable machine-readable code string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::UnknownTree => "unknown_tree",
            ValidationCode::UnknownRecord => "unknown_record",
            ValidationCode::UnknownParent => "unknown_parent",
            ValidationCode::UnknownElement => "unknown_element",
            ValidationCode::UnknownNode => "unknown_node",
            ValidationCode::LibraryForbiddenAsChild => "library_forbidden_as_child",
            ValidationCode::ElementAlreadyPresent => "element_already_present",
            ValidationCode::ElementAlreadyPresentInAncestors => {
                "element_already_present_in_ancestors"
            }
            ValidationCode::SystemTree => "system_tree",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed check, keyed by the input field it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    /// Input field the failure applies to (`tree`, `element`, `parent`, `node`).
    pub field: String,
    /// Reason code.
    pub code: ValidationCode,
}

/// Validation failure carrying one or more field-keyed reasons.
///
/// Mutation validation collects every failing check instead of stopping at
/// the first one, so a caller can report all problems in one round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationError {
    /// All failed checks, in the order they were recorded.
    pub failures: Vec<FieldFailure>,
}

impl ValidationError {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a validation error with a single failure.
    pub fn single(field: impl Into<String>, code: ValidationCode) -> Self {
        let mut err = Self::new();
        err.push(field, code);
        err
    }

    /// Record a failure for `field`.
    pub fn push(&mut self, field: impl Into<String>, code: ValidationCode) {
        self.failures.push(FieldFailure {
            field: field.into(),
            code,
        });
    }

    /// True when no failure has been recorded.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when any recorded failure carries `code`.
    pub fn contains(&self, code: ValidationCode) -> bool {
        self.failures.iter().any(|f| f.code == code)
    }

    /// Consume the collector: `Ok(())` when empty, `Err(self)` otherwise.
    pub fn check(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed:")?;
        for failure in &self.failures {
            write!(f, " {}={}", failure.field, failure.code)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Permission check failures. Short-circuit immediately, never collected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("Action {action} denied for user {user}")]
    Denied { action: ActionName, user: UserId },
}

/// Storage layer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Tree not found: {tree}")]
    TreeNotFound { tree: TreeId },

    #[error("Node not found: {node} in tree {tree}")]
    NodeNotFound { tree: TreeId, node: NodeId },

    #[error("Insert failed in tree {tree}: {reason}")]
    InsertFailed { tree: TreeId, reason: String },

    #[error("Corrupt topology in tree {tree}: {reason}")]
    CorruptTopology { tree: TreeId, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Backend error: {reason}")]
    Backend { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Action {action} is not registered for permission kind {kind}")]
    UnknownAction {
        kind: PermissionKind,
        action: ActionName,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for all engine errors.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// TESTS
// =============================================================================
