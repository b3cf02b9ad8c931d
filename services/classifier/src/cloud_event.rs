use crate::blob_store::BlobRef;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An inbound message that is not a usable blob-created envelope
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed event: `{field}` {reason}")]
pub struct MalformedEventError {
    /// Offending field, dotted for nested fields (`data.url`)
    pub field: String,
    pub reason: String,
}

impl MalformedEventError {
    pub fn missing(field: &str) -> Self {
        Self {
            field: field.to_string(),
            reason: "is missing or empty".to_string(),
        }
    }

    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Storage-specific payload of a blob-created event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    /// Storage API used to create the blob (PutBlob, CopyObject, ...)
    pub api: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    #[serde(rename = "eTag")]
    pub etag: Option<String>,
    #[serde(rename = "url")]
    pub blob_url: String,
}

/// Decoded CloudEvent envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundEvent {
    #[serde(rename = "id")]
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: Option<String>,
    pub subject: String,
    pub time: Option<DateTime<Utc>>,
    pub specversion: Option<String>,
    pub data: EventData,
}

#[derive(Deserialize)]
struct RawEvent {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    source: Option<String>,
    subject: Option<String>,
    time: Option<String>,
    specversion: Option<String>,
    data: Option<RawEventData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEventData {
    api: Option<String>,
    content_type: Option<String>,
    content_length: Option<serde_json::Value>,
    #[serde(rename = "eTag")]
    etag: Option<String>,
    url: Option<String>,
    blob_url: Option<String>,
}

/// Decode one queue message into an [`InboundEvent`].
///
/// The body is either the JSON envelope itself or its base64 encoding, as
/// storage queues deliver it.
pub fn decode(body: &[u8]) -> Result<InboundEvent, MalformedEventError> {
    let json = envelope_json(body)?;

    let raw: RawEvent = serde_json::from_slice(&json)
        .map_err(|e| MalformedEventError::invalid("body", format!("is not a JSON object: {e}")))?;

    let event_id = required(raw.id, "id")?;
    let event_type = required(raw.event_type, "type")?;
    let subject = required(raw.subject, "subject")?;
    let data = raw.data.ok_or_else(|| MalformedEventError::missing("data"))?;

    let blob_url = non_empty(data.url)
        .or_else(|| non_empty(data.blob_url))
        .ok_or_else(|| MalformedEventError::missing("data.url"))?;

    let time = match non_empty(raw.time) {
        Some(time) => Some(
            DateTime::parse_from_rfc3339(&time)
                .map_err(|e| MalformedEventError::invalid("time", format!("is not RFC 3339: {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let content_length = match data.content_length {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    };

    Ok(InboundEvent {
        event_id,
        event_type,
        source: non_empty(raw.source),
        subject,
        time,
        specversion: non_empty(raw.specversion),
        data: EventData {
            api: non_empty(data.api),
            content_type: non_empty(data.content_type),
            content_length,
            etag: non_empty(data.etag),
            blob_url,
        },
    })
}

fn envelope_json(body: &[u8]) -> Result<Vec<u8>, MalformedEventError> {
    let trimmed = body.trim_ascii();
    if trimmed.first() == Some(&b'{') {
        return Ok(trimmed.to_vec());
    }

    STANDARD
        .decode(trimmed)
        .map_err(|_| MalformedEventError::invalid("body", "is neither JSON nor base64-encoded JSON"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required(value: Option<String>, field: &str) -> Result<String, MalformedEventError> {
    non_empty(value).ok_or_else(|| MalformedEventError::missing(field))
}

impl InboundEvent {
    /// Locate the blob the event is about.
    ///
    /// The subject (`/blobServices/default/containers/{c}/blobs/{name}`) wins;
    /// the path of the blob URL (`/{c}/{name}`) is the fallback.
    pub fn blob_ref(&self) -> Result<BlobRef, MalformedEventError> {
        blob_ref_from_subject(&self.subject)
            .or_else(|| blob_ref_from_url(&self.data.blob_url))
            .ok_or_else(|| {
                MalformedEventError::invalid("subject", "does not name a container and blob")
            })
    }
}

fn blob_ref_from_subject(subject: &str) -> Option<BlobRef> {
    let parts: Vec<&str> = subject.split('/').collect();
    let container_idx = parts.iter().position(|p| *p == "containers")? + 1;
    let blob_idx = parts.iter().position(|p| *p == "blobs")? + 1;

    let container = parts.get(container_idx).filter(|c| !c.is_empty())?;
    let name = parts.get(blob_idx..)?.join("/");
    if name.is_empty() {
        return None;
    }

    Some(BlobRef::new(*container, name))
}

fn blob_ref_from_url(blob_url: &str) -> Option<BlobRef> {
    let url = reqwest::Url::parse(blob_url).ok()?;
    let segments: Vec<String> = url
        .path_segments()?
        .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.to_string()))
        .collect();

    let (container, rest) = segments.split_first()?;
    let name = rest.join("/");
    if container.is_empty() || name.is_empty() {
        return None;
    }

    Some(BlobRef::new(container.clone(), name))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn blob_created_json(id: &str, blob_name: &str) -> String {
        serde_json::json!({
            "id": id,
            "source": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/acct",
            "specversion": "1.0",
            "type": "Microsoft.Storage.BlobCreated",
            "subject": format!("/blobServices/default/containers/stampedstorage/blobs/{blob_name}"),
            "time": "2024-01-15T10:30:00Z",
            "data": {
                "api": "PutBlob",
                "contentType": "application/pdf",
                "contentLength": 52431,
                "eTag": "0x8DC15F2A1B2C3D4",
                "url": format!("https://acct.blob.core.windows.net/stampedstorage/{blob_name}")
            }
        })
        .to_string()
    }

    #[test]
    fn test_decode_blob_created_event() {
        let event = decode(blob_created_json("abc-123", "report.pdf").as_bytes()).unwrap();

        assert_eq!(event.event_id, "abc-123");
        assert_eq!(event.event_type, "Microsoft.Storage.BlobCreated");
        assert_eq!(event.data.api.as_deref(), Some("PutBlob"));
        assert_eq!(event.data.content_length, Some(52431));
        assert_eq!(event.data.etag.as_deref(), Some("0x8DC15F2A1B2C3D4"));
        assert_eq!(event.time.unwrap().to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }

    #[test]
    fn test_decode_base64_body() {
        let encoded = STANDARD.encode(blob_created_json("abc-123", "report.pdf"));
        let event = decode(encoded.as_bytes()).unwrap();
        assert_eq!(event.event_id, "abc-123");
    }

    #[test]
    fn test_missing_required_fields_name_the_field() {
        let mut value: serde_json::Value =
            serde_json::from_str(&blob_created_json("abc-123", "report.pdf")).unwrap();
        value["id"] = serde_json::Value::String("  ".to_string());
        let err = decode(value.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.field, "id");

        let mut value: serde_json::Value =
            serde_json::from_str(&blob_created_json("abc-123", "report.pdf")).unwrap();
        value["data"].as_object_mut().unwrap().remove("url");
        let err = decode(value.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.field, "data.url");

        let mut value: serde_json::Value =
            serde_json::from_str(&blob_created_json("abc-123", "report.pdf")).unwrap();
        value.as_object_mut().unwrap().remove("subject");
        let err = decode(value.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.field, "subject");
    }

    #[test]
    fn test_blob_url_alias_is_accepted() {
        let body = serde_json::json!({
            "id": "evt-1",
            "type": "Microsoft.Storage.BlobCreated",
            "subject": "/blobServices/default/containers/stampedstorage/blobs/a.pdf",
            "data": { "blobUrl": "https://acct.blob.core.windows.net/stampedstorage/a.pdf" }
        });
        let event = decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(event.data.blob_url, "https://acct.blob.core.windows.net/stampedstorage/a.pdf");
        assert!(event.time.is_none());
    }

    #[test]
    fn test_garbage_and_bad_time_are_rejected() {
        assert_eq!(decode(b"not json at all!").unwrap_err().field, "body");

        let mut value: serde_json::Value =
            serde_json::from_str(&blob_created_json("abc-123", "report.pdf")).unwrap();
        value["time"] = serde_json::Value::String("yesterday".to_string());
        assert_eq!(decode(value.to_string().as_bytes()).unwrap_err().field, "time");
    }

    #[test]
    fn test_blob_ref_from_nested_subject() {
        let event = decode(blob_created_json("abc-123", "2024/01/report.pdf").as_bytes()).unwrap();
        let blob = event.blob_ref().unwrap();
        assert_eq!(blob.container, "stampedstorage");
        assert_eq!(blob.name, "2024/01/report.pdf");
        assert_eq!(blob.file_name(), "report.pdf");
    }

    #[test]
    fn test_blob_ref_falls_back_to_url() {
        let mut event = decode(blob_created_json("abc-123", "report.pdf").as_bytes()).unwrap();
        event.subject = "unrelated".to_string();
        event.data.blob_url =
            "https://acct.blob.core.windows.net/stampedstorage/in%20box/report%201.pdf".to_string();

        let blob = event.blob_ref().unwrap();
        assert_eq!(blob.container, "stampedstorage");
        assert_eq!(blob.name, "in box/report 1.pdf");

        event.data.blob_url = "https://acct.blob.core.windows.net/".to_string();
        assert_eq!(event.blob_ref().unwrap_err().field, "subject");
    }
}
