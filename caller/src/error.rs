// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the chain client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallerError {
    // Connection, timeout or rate limit style failures that may clear up on retry
    #[error("Transient provider error: {0}")]
    TransientProviderError(String),

    // The provider answered but the answer was an error
    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Provider returned a malformed response: {0}")]
    InvalidResponse(String),

    #[error("Header {0} not found")]
    HeaderNotFound(u64),

    #[error("Latest header not found")]
    LatestHeaderNotFound,

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Chain id mismatch: configured {configured}, provider reports {actual}")]
    ChainIdMismatch { configured: u64, actual: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CallerError {
    /// Stable label for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            CallerError::TransientProviderError(_) => "transient_provider",
            CallerError::ProviderError(_) => "provider",
            CallerError::InvalidResponse(_) => "invalid_response",
            CallerError::HeaderNotFound(_) => "header_not_found",
            CallerError::LatestHeaderNotFound => "latest_header_not_found",
            CallerError::Timeout(_) => "timeout",
            CallerError::ChainIdMismatch { .. } => "chain_id_mismatch",
            CallerError::InvalidInput(_) => "invalid_input",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallerError::TransientProviderError(_)
                | CallerError::Timeout(_)
                | CallerError::HeaderNotFound(_)
                | CallerError::LatestHeaderNotFound
        )
    }
}

impl From<ethers::providers::ProviderError> for CallerError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        match e {
            ethers::providers::ProviderError::SerdeJson(e) => {
                CallerError::InvalidResponse(e.to_string())
            }
            other => CallerError::TransientProviderError(other.to_string()),
        }
    }
}

pub type CallerResult<T> = Result<T, CallerError>;
