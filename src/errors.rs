use thiserror::Error;

/// Typed error hierarchy for relevo.
///
/// Use at module boundaries (webhook auth, tenant resolution, agent calls).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum RelevoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("No tenant matches {0}")]
    TenantNotFound(String),

    #[error("Tenant {0} is inactive")]
    TenantInactive(String),

    /// Agent engine failure. Transport-level failures (connect, timeout) are
    /// retryable; structured non-2xx responses are not.
    #[error("Agent error: {message}")]
    Agent { message: String, retryable: bool },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RelevoError {
    /// Whether this error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Agent { retryable, .. } => *retryable,
            Self::Config(_)
            | Self::Auth(_)
            | Self::MalformedPayload(_)
            | Self::TenantNotFound(_)
            | Self::TenantInactive(_)
            | Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_transport_error_is_retryable() {
        let err = RelevoError::Agent {
            message: "connection timed out".into(),
            retryable: true,
        };
        assert_eq!(err.to_string(), "Agent error: connection timed out");
        assert!(err.is_retryable());
    }

    #[test]
    fn agent_structured_error_not_retryable() {
        let err = RelevoError::Agent {
            message: "422 unprocessable".into(),
            retryable: false,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn auth_error_not_retryable() {
        let err = RelevoError::Auth("signature mismatch".into());
        assert_eq!(err.to_string(), "Authentication failed: signature mismatch");
        assert!(!err.is_retryable());
    }

    #[test]
    fn tenant_errors_display() {
        let err = RelevoError::TenantNotFound("5215512345678".into());
        assert_eq!(err.to_string(), "No tenant matches 5215512345678");
        let err = RelevoError::TenantInactive("tnt_1".into());
        assert_eq!(err.to_string(), "Tenant tnt_1 is inactive");
    }

    #[test]
    fn internal_from_anyhow() {
        let err: RelevoError = anyhow::anyhow!("store unavailable").into();
        assert!(matches!(err, RelevoError::Internal(_)));
        assert!(!err.is_retryable());
    }
}
