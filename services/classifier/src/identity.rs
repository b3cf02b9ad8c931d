use crate::blob_store::BlobMetadataMap;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Metadata key carrying an upstream-assigned identity
pub const FILE_ID_KEY: &str = "file_id";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot resolve a file identity: no file_id metadata, no event id and no file name")]
pub struct IdentityResolutionError;

/// Which rule produced the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    BlobMetadata,
    EventId,
    /// Timestamp plus file name; a redelivery may produce a different value
    Generated,
}

impl IdentitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySource::BlobMetadata => "blob_metadata",
            IdentitySource::EventId => "event_id",
            IdentitySource::Generated => "generated",
        }
    }
}

/// Idempotency key shared by the blob metadata and the transaction record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    id: String,
    source: IdentitySource,
}

impl FileIdentity {
    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> IdentitySource {
        self.source
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Resolve the identity of a blob, first rule that yields a value wins:
/// the blob's own `file_id` metadata, then the event id, then a value
/// generated from `now` and the file name.
pub fn resolve_file_id(
    blob_metadata: Option<&BlobMetadataMap>,
    event_id: Option<&str>,
    file_name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<FileIdentity, IdentityResolutionError> {
    let from_metadata = blob_metadata
        .and_then(|metadata| metadata.get(FILE_ID_KEY))
        .map(|id| id.trim())
        .filter(|id| !id.is_empty());
    if let Some(id) = from_metadata {
        return Ok(FileIdentity {
            id: id.to_string(),
            source: IdentitySource::BlobMetadata,
        });
    }

    if let Some(id) = event_id.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(FileIdentity {
            id: id.to_string(),
            source: IdentitySource::EventId,
        });
    }

    let file_name = file_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(IdentityResolutionError)?;

    Ok(FileIdentity {
        id: format!("{}_{}", now.format("%Y%m%d%H%M%S"), sanitize_file_name(file_name)),
        source: IdentitySource::Generated,
    })
}

fn sanitize_file_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
