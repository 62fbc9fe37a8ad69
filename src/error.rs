use thiserror::Error;

/// Failures reported by the instrumentation engine for a single class file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstrumentError {
    /// The input is not a structurally valid class file.
    #[error("malformed class file: {reason}")]
    MalformedClassFile { reason: String },
    /// Internal consistency failure while rewriting a structurally valid class.
    #[error("instrumentation invariant violated in {method}: {reason}")]
    InvariantViolation { method: String, reason: String },
}

impl InstrumentError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedClassFile {
            reason: reason.into(),
        }
    }

    pub(crate) fn invariant(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Whether the batch must stop instead of skipping the file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

pub(crate) type Result<T> = std::result::Result<T, InstrumentError>;
