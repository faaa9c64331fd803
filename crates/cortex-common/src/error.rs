use thiserror::Error;

/// Error taxonomy shared across the workspace.
///
/// `Validation`, `NotFound`, `Conflict` and `InvariantViolation` always
/// surface to the caller. `Transport` is retryable. Degraded operation
/// (failed extraction, embedding or graph sync) is never an error value;
/// callers observe it through results and observer events instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CortexError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("transport: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, CortexError>;

impl CortexError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CortexError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CortexError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CortexError::Conflict(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        CortexError::InvariantViolation(msg.into())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        CortexError::Transport(err.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CortexError::Transport(_))
    }
}

/// Stored rows that fail to decode indicate storage corruption, not a
/// caller mistake.
impl From<serde_json::Error> for CortexError {
    fn from(err: serde_json::Error) -> Self {
        CortexError::InvariantViolation(format!("row decode failed: {err}"))
    }
}

/// Reject empty or whitespace-only identifiers.
pub fn require_id(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CortexError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Result-set limits are bounded to [1, 1000].
pub fn require_limit(limit: usize) -> Result<()> {
    if limit == 0 || limit > 1000 {
        return Err(CortexError::validation(format!(
            "limit must be within [1, 1000], got {limit}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CortexError::transport("socket closed").is_retryable());
        assert!(!CortexError::validation("bad id").is_retryable());
        assert!(!CortexError::not_found("fact f1").is_retryable());
    }

    #[test]
    fn test_require_id() {
        assert!(require_id("abc", "id").is_ok());
        assert!(matches!(
            require_id("   ", "memorySpaceId"),
            Err(CortexError::Validation(_))
        ));
    }

    #[test]
    fn test_require_limit_bounds() {
        assert!(require_limit(1).is_ok());
        assert!(require_limit(1000).is_ok());
        assert!(require_limit(0).is_err());
        assert!(require_limit(1001).is_err());
    }
}
