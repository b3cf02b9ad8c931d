//! Failure taxonomy for one pipeline run and the acknowledge/redeliver
//! decision derived from it.

use crate::blob_store::BlobAccessError;
use crate::classification_client::ClassificationApiError;
use crate::cloud_event::MalformedEventError;
use crate::identity::IdentityResolutionError;
use crate::transaction_client::UpsertError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// How an outbound HTTP call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailureKind {
    /// Connect, read or total budget expired
    Timeout,
    /// The server answered with a non-success status
    HttpError { status: u16 },
    /// The request never got an answer (DNS, refused, reset, TLS, ...)
    NetworkError,
    /// The server answered 2xx with a body we could not use
    InvalidResponse,
}

impl CallFailureKind {
    /// Classify a transport-level reqwest error
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            CallFailureKind::Timeout
        } else if let Some(status) = err.status() {
            CallFailureKind::HttpError {
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            CallFailureKind::InvalidResponse
        } else {
            CallFailureKind::NetworkError
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallFailureKind::Timeout => "timeout",
            CallFailureKind::HttpError { .. } => "http_error",
            CallFailureKind::NetworkError => "network_error",
            CallFailureKind::InvalidResponse => "invalid_response",
        }
    }
}

impl fmt::Display for CallFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailureKind::HttpError { status } => write!(f, "http_error (status {status})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Any failure that ends a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    MalformedEvent(#[from] MalformedEventError),

    #[error(transparent)]
    IdentityResolution(#[from] IdentityResolutionError),

    #[error(transparent)]
    BlobAccess(#[from] BlobAccessError),

    #[error(transparent)]
    Classification(#[from] ClassificationApiError),

    #[error(transparent)]
    Upsert(#[from] UpsertError),

    #[error("failed to encode output document: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("processing did not finish within {budget:?}")]
    ProcessingTimeout { budget: Duration },
}

impl PipelineError {
    /// Pipeline stage the failure happened in
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::MalformedEvent(_) => "decode",
            PipelineError::IdentityResolution(_) => "identity",
            PipelineError::BlobAccess(_) => "blob",
            PipelineError::Classification(_) => "classify",
            PipelineError::Upsert(e) => e.stage.as_str(),
            PipelineError::Encoding(_) => "encode",
            PipelineError::ProcessingTimeout { .. } => "deadline",
        }
    }

    /// Short failure kind for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedEvent(_) => "malformed_event",
            PipelineError::IdentityResolution(_) => "identity_resolution",
            PipelineError::BlobAccess(e) => e.kind(),
            PipelineError::Classification(e) => e.kind.as_str(),
            PipelineError::Upsert(e) => e.kind.as_str(),
            PipelineError::Encoding(_) => "encoding",
            PipelineError::ProcessingTimeout { .. } => "processing_timeout",
        }
    }

    /// Whether a later attempt at the same message may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::MalformedEvent(_)
            | PipelineError::IdentityResolution(_)
            | PipelineError::Encoding(_) => false,
            PipelineError::Classification(e) => !e.is_content_rejection(),
            PipelineError::BlobAccess(_)
            | PipelineError::Upsert(_)
            | PipelineError::ProcessingTimeout { .. } => true,
        }
    }

    pub fn disposition(&self) -> Disposition {
        if self.is_transient() {
            Disposition::Redeliver
        } else {
            Disposition::Acknowledge
        }
    }
}

/// What the delivery mechanism should do with the triggering message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The unit of work is consumed
    Acknowledge,
    /// Leave the message for another attempt
    Redeliver,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acknowledge => "acknowledge",
            Disposition::Redeliver => "redeliver",
        }
    }
}
