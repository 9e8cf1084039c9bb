// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types.
//!
//! Every failure in the pipeline is classified by [`ErrorKind`]. Retry decisions
//! are made from the kind, never from message text.

/// Classification used for retry-vs-terminal decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    QuotaExceeded,
    TransientDependency,
    AuthExpired,
    EncodingContractViolation,
    ChecksumMismatch,
    Rejected,
    NotFound,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind should be redelivered.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientDependency)
    }

    /// Whether the reason text is safe and useful to show to the user.
    pub fn is_user_visible(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::QuotaExceeded | ErrorKind::AuthExpired
        )
    }
}

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("Dependency unavailable: {0}")]
    Transient(String),

    #[error("Credential for {destination} expired and could not be refreshed")]
    AuthExpired { destination: String },

    #[error("Encoding contract violated: {0}")]
    EncodingContract(String),

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Rejected by remote service (HTTP {status}): {details}")]
    Rejected { status: u16, details: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            AppError::Transient(_) => ErrorKind::TransientDependency,
            AppError::AuthExpired { .. } => ErrorKind::AuthExpired,
            AppError::EncodingContract(_) => ErrorKind::EncodingContractViolation,
            AppError::ChecksumMismatch(_) => ErrorKind::ChecksumMismatch,
            AppError::Rejected { .. } => ErrorKind::Rejected,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Reason recorded on the execution record and shown to the user.
    ///
    /// Internal failures are reported opaquely.
    pub fn public_reason(&self) -> String {
        if self.kind().is_user_visible() {
            self.to_string()
        } else {
            match self.kind() {
                ErrorKind::TransientDependency => "temporarily unavailable".to_string(),
                ErrorKind::NotFound => "not found".to_string(),
                _ => "internal error".to_string(),
            }
        }
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(AppError::Transient("pubsub".into()).is_retryable());

        for err in [
            AppError::Validation("bad".into()),
            AppError::QuotaExceeded("limit".into()),
            AppError::AuthExpired {
                destination: "strava".into(),
            },
            AppError::EncodingContract("offsets".into()),
            AppError::ChecksumMismatch("trailer".into()),
            AppError::Rejected {
                status: 422,
                details: "duplicate".into(),
            },
            AppError::NotFound("user".into()),
            AppError::Internal(anyhow::anyhow!("boom")),
        ] {
            assert!(!err.is_retryable(), "{err} should be terminal");
        }
    }

    #[test]
    fn internal_reason_is_opaque() {
        let err = AppError::Internal(anyhow::anyhow!("secret connection string"));
        assert_eq!(err.public_reason(), "internal error");

        let err = AppError::QuotaExceeded("Free tier limit reached (25/month)".into());
        assert!(err.public_reason().contains("25/month"));
    }
}
