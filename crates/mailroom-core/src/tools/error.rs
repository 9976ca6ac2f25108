use serde_json::{Value, json};
use thiserror::Error;

use crate::cache::CacheError;
use crate::cleanup::{CleanupError, PolicyError, ScheduleError};
use crate::emails::EmailError;
use crate::factory::FactoryError;
use crate::gmail::MailApiError;
use crate::jobs::JobStoreError;
use crate::rules::RuleError;
use crate::searches::SavedSearchError;
use crate::sessions::SessionError;

/// The protocol-facing error taxonomy. Everything a handler can fail with
/// collapses into one of these before it crosses the JSON-RPC boundary, so
/// no internal detail (and no other user's data) ever leaks into a
/// response.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient external failure: {0}")]
    Transient(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("data integrity failure: {0}")]
    DataIntegrity(String),
}

impl ToolError {
    pub fn code(&self) -> i64 {
        match self {
            ToolError::InvalidRequest(_) => -32600,
            ToolError::MethodNotFound(_) => -32601,
            ToolError::InvalidParams(_) => -32602,
            ToolError::Internal(_) => -32603,
            ToolError::NotFound(_) => -32001,
            ToolError::Transient(_) => -32002,
            ToolError::DataIntegrity(_) => -32003,
        }
    }

    pub fn to_error_value(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

impl From<SessionError> for ToolError {
    fn from(err: SessionError) -> Self {
        // All session failures present the same way; which one happened is
        // not the caller's business.
        ToolError::InvalidRequest(err.to_string())
    }
}

impl From<FactoryError> for ToolError {
    fn from(err: FactoryError) -> Self {
        match err {
            FactoryError::InvalidUserId(_) => ToolError::InvalidRequest(err.to_string()),
            other => ToolError::Internal(other.to_string()),
        }
    }
}

impl From<EmailError> for ToolError {
    fn from(err: EmailError) -> Self {
        match err {
            EmailError::NotFound(id) => ToolError::NotFound(id),
            other => ToolError::Internal(other.to_string()),
        }
    }
}

impl From<JobStoreError> for ToolError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => ToolError::NotFound(id),
            JobStoreError::DuplicateInstance(_) => ToolError::DataIntegrity(err.to_string()),
            other => ToolError::Internal(other.to_string()),
        }
    }
}

impl From<PolicyError> for ToolError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::NotFound(id) => ToolError::NotFound(id),
            PolicyError::PriorityOutOfRange(_) => ToolError::InvalidParams(err.to_string()),
            other => ToolError::Internal(other.to_string()),
        }
    }
}

impl From<ScheduleError> for ToolError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::InvalidExpression { .. } | ScheduleError::UnknownType(_) => {
                ToolError::InvalidParams(err.to_string())
            }
            ScheduleError::PolicyNotFound(id) | ScheduleError::NotFound(id) => {
                ToolError::NotFound(id)
            }
            other => ToolError::Internal(other.to_string()),
        }
    }
}

impl From<SavedSearchError> for ToolError {
    fn from(err: SavedSearchError) -> Self {
        match err {
            SavedSearchError::EmptyName => ToolError::InvalidParams(err.to_string()),
            SavedSearchError::NotFound(name) => ToolError::NotFound(name),
            other => ToolError::Internal(other.to_string()),
        }
    }
}

impl From<CleanupError> for ToolError {
    fn from(err: CleanupError) -> Self {
        match err {
            CleanupError::NotFound(id) => ToolError::NotFound(id),
            CleanupError::Disabled(_) | CleanupError::ConfirmationRequired(_) => {
                ToolError::InvalidParams(err.to_string())
            }
            CleanupError::Policy(inner) => inner.into(),
            CleanupError::Email(inner) => inner.into(),
        }
    }
}

impl From<MailApiError> for ToolError {
    fn from(err: MailApiError) -> Self {
        if err.is_transient() {
            ToolError::Transient(err.to_string())
        } else {
            ToolError::Internal(err.to_string())
        }
    }
}

impl From<CacheError> for ToolError {
    fn from(err: CacheError) -> Self {
        ToolError::Internal(err.to_string())
    }
}

impl From<RuleError> for ToolError {
    fn from(err: RuleError) -> Self {
        ToolError::InvalidParams(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_jsonrpc_taxonomy() {
        assert_eq!(ToolError::InvalidRequest("x".into()).code(), -32600);
        assert_eq!(ToolError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(ToolError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(ToolError::Internal("x".into()).code(), -32603);
        assert_eq!(ToolError::NotFound("x".into()).code(), -32001);
    }

    #[test]
    fn session_errors_collapse_into_invalid_request() {
        for err in [
            SessionError::NotFound,
            SessionError::UserMismatch,
            SessionError::Expired,
        ] {
            let tool_err: ToolError = err.into();
            assert!(matches!(tool_err, ToolError::InvalidRequest(_)));
        }
    }

    #[test]
    fn error_value_carries_code_and_message() {
        let value = ToolError::NotFound("job_1".into()).to_error_value();
        assert_eq!(value["code"], -32001);
        assert_eq!(value["message"], "not found: job_1");
    }
}
