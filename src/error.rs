//! Error types for WFMS
//!
//! Protocol faults and command rejections are not errors here: the codec
//! reports malformed lines as `ERR` frames and the admission path reports
//! refusals as [`crate::command::Rejection`] values. What remains are
//! configuration faults and internal invariant violations.

use thiserror::Error;

/// Result type alias for WFMS operations
pub type Result<T> = std::result::Result<T, WfmsError>;

/// Main error type for WFMS operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WfmsError {
    /// Rules configuration error
    #[error("Rules error: {0}")]
    Rules(#[from] RulesError),

    /// Command could not be encoded for the wire
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

/// Invalid rules configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RulesError {
    /// A cooldown or TTL is above its allowed maximum
    #[error("{field} must be at most {max_secs}s (got {actual_secs}s)")]
    OutOfRange {
        field: &'static str,
        max_secs: u64,
        actual_secs: u64,
    },
}

/// Errors while turning a command into a wire line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Every numeric controller id is currently bound to a live correlation id
    #[error("Controller id space exhausted ({live} live mappings)")]
    IdSpaceExhausted { live: usize },

    /// Payload serialization failed
    #[error("Serialization failed: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WfmsError::Rules(RulesError::OutOfRange {
            field: "cooldownGlobal",
            max_secs: 60,
            actual_secs: 90,
        });
        let msg = format!("{}", err);
        assert!(msg.contains("cooldownGlobal"));
        assert!(msg.contains("60"));
    }

    #[test]
    fn test_error_conversion() {
        let cmd_err = CommandError::IdSpaceExhausted { live: 3 };
        let err: WfmsError = cmd_err.into();
        assert!(matches!(err, WfmsError::Command(_)));
    }
}
