//! Error types shared by all operator-related functionality.
use thiserror::Error;

/// Convenience alias for results produced by `feop`.
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors produced while building, applying or assembling operators.
///
/// Every variant names the entity that failed and the condition that was violated.
/// Validation always happens before any data is touched, so an error never leaves
/// an operator, context or vector partially modified.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// A lifecycle invariant was violated (double borrow, restore without borrow, ...).
    #[error("invalid state in {entity}: {reason}")]
    InvalidState { entity: String, reason: String },

    /// A field with the same name has already been bound.
    #[error("field \"{field}\" is already bound on {entity}")]
    NameConflict { entity: String, field: String },

    /// The field name is not declared by the pointwise function.
    #[error("field \"{field}\" is not declared by {entity}")]
    UnknownField { entity: String, field: String },

    /// Sizes of restrictions, bases or vectors disagree.
    #[error("incompatible shape in {entity}: {reason}")]
    IncompatibleShape { entity: String, reason: String },

    /// The operator is missing field bindings.
    #[error("{entity} is not ready: {reason}")]
    NotReady { entity: String, reason: String },

    /// Input and output vectors refer to the same storage.
    #[error("{entity}: input and output vectors must be distinct")]
    AliasingError { entity: String },

    /// Linear assembly was requested on an operator declared nonlinear.
    #[error("{entity} is not linear: {reason}")]
    NotLinear { entity: String, reason: String },

    /// Linear assembly was requested on an operator that is not square single-field.
    #[error("unsupported shape for {entity}: {reason}")]
    UnsupportedShape { entity: String, reason: String },

    /// An error raised during execution, typically by a user-supplied pointwise function.
    #[error("backend failure in {call}")]
    BackendFailure {
        call: String,
        #[source]
        source: eyre::Report,
    },
}

impl OperatorError {
    pub(crate) fn invalid_state(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible_shape(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IncompatibleShape {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_ready(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotReady {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported_shape(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedShape {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn backend(call: impl Into<String>, source: eyre::Report) -> Self {
        Self::BackendFailure {
            call: call.into(),
            source,
        }
    }

    /// A short, stable name for the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::NameConflict { .. } => ErrorKind::NameConflict,
            Self::UnknownField { .. } => ErrorKind::UnknownField,
            Self::IncompatibleShape { .. } => ErrorKind::IncompatibleShape,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::AliasingError { .. } => ErrorKind::AliasingError,
            Self::NotLinear { .. } => ErrorKind::NotLinear,
            Self::UnsupportedShape { .. } => ErrorKind::UnsupportedShape,
            Self::BackendFailure { .. } => ErrorKind::BackendFailure,
        }
    }
}

/// Payload-free discriminant of [`OperatorError`], convenient for matching in tests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidState,
    NameConflict,
    UnknownField,
    IncompatibleShape,
    NotReady,
    AliasingError,
    NotLinear,
    UnsupportedShape,
    BackendFailure,
}
