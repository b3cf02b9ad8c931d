use crate::blob_store::{BlobAccessError, BlobMetadataMap, BlobRef, BoundedBlobStore};
use crate::classification_client::ClassificationResult;
use crate::cloud_event::InboundEvent;
use crate::config::Config;
use crate::identity::{FileIdentity, FILE_ID_KEY};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument, warn};

/// Classification fields copied verbatim into blob metadata
const CLASSIFICATION_DETAIL_KEYS: [&str; 7] = [
    "subcategory",
    "expected_category",
    "expected_subcategory",
    "evaluation_type",
    "evaluation_verdict",
    "classifier_reasoning",
    "classifier_keywords",
];

/// Keys given up, in order, when a blob's metadata exceeds the total budget
const BUDGET_SHED_ORDER: [&str; 9] = [
    "classifier_reasoning",
    "classifier_keywords",
    "expected_subcategory",
    "expected_category",
    "evaluation_type",
    "evaluation_verdict",
    "subcategory",
    "cloud_event_source",
    "original_filename",
];

/// Shorter than this (plus `...`) and a key is dropped instead of shortened
const MIN_SHORTENED_LEN: usize = 16;

/// How a key was changed to fit the total metadata budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetAction {
    Shortened,
    Dropped,
}

impl BudgetAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetAction::Shortened => "shortened",
            BudgetAction::Dropped => "dropped",
        }
    }
}

/// A metadata value after sanitisation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedValue {
    pub value: String,
    pub truncated: bool,
}

/// Make a value acceptable as blob metadata: printable ASCII only, single
/// spaces, and at most `max_len` characters (longer values end in `...`).
pub fn sanitize_metadata_value(value: &str, max_len: usize) -> SanitizedValue {
    let printable: String = value
        .chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\t') { ' ' } else { c })
        .filter(|c| (' '..='~').contains(c))
        .collect();
    let collapsed = printable.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.len() <= max_len {
        return SanitizedValue {
            value: collapsed,
            truncated: false,
        };
    }

    // ASCII only at this point, so byte offsets are char offsets
    let value = if max_len > 3 {
        format!("{}...", &collapsed[..max_len - 3])
    } else {
        collapsed[..max_len].to_string()
    };

    SanitizedValue {
        value,
        truncated: true,
    }
}

/// Overlay `updates` on `existing`; updates win on key collision
pub fn merge(existing: BlobMetadataMap, updates: BlobMetadataMap) -> BlobMetadataMap {
    let mut merged = existing;
    merged.extend(updates);
    merged
}

/// Size of `metadata` as the object store counts it: key plus value bytes
pub fn metadata_size(metadata: &BlobMetadataMap) -> usize {
    metadata.iter().map(|(key, value)| key.len() + value.len()).sum()
}

/// Shorten, then drop, low-priority keys until `metadata` fits in `budget`
/// bytes. Values must already be sanitised (ASCII).
fn fit_to_budget(metadata: &mut BlobMetadataMap, budget: usize) -> Vec<(String, BudgetAction)> {
    let mut changed = Vec::new();

    for key in BUDGET_SHED_ORDER {
        let size = metadata_size(metadata);
        if size <= budget {
            break;
        }
        let overflow = size - budget;
        let Some(value) = metadata.get_mut(key) else {
            continue;
        };

        if value.len() >= overflow + MIN_SHORTENED_LEN + 3 {
            value.truncate(value.len() - overflow - 3);
            value.push_str("...");
            changed.push((key.to_string(), BudgetAction::Shortened));
        } else {
            metadata.remove(key);
            changed.push((key.to_string(), BudgetAction::Dropped));
        }
    }

    changed
}

/// Reads, merges and writes blob metadata within the backend's limits
pub struct BlobMetadataWriter {
    store: BoundedBlobStore,
    max_value_length: usize,
    max_total_bytes: usize,
}

impl BlobMetadataWriter {
    pub fn new(store: BoundedBlobStore, config: &Config) -> Self {
        Self {
            store,
            max_value_length: config.metadata_max_length,
            max_total_bytes: config.metadata_max_total_bytes,
        }
    }

    pub async fn read(&self, blob: &BlobRef) -> Result<BlobMetadataMap, BlobAccessError> {
        self.store.get_metadata(blob).await
    }

    /// Merge `updates` into the current metadata of `blob` and write the
    /// result back with a single metadata call. Returns what was written.
    #[instrument(skip(self, updates), fields(blob = %blob, updates = updates.len()))]
    pub async fn merge_and_write(
        &self,
        blob: &BlobRef,
        updates: BlobMetadataMap,
    ) -> Result<BlobMetadataMap, BlobAccessError> {
        let current = self.read(blob).await?;
        let merged = self.prepare(merge(current, updates));

        self.store.set_metadata(blob, merged.clone()).await?;

        debug!(keys = merged.len(), "Blob metadata written");
        Ok(merged)
    }

    /// Sanitise every value of `metadata`, truncating over-long ones, then
    /// trim low-priority keys until the whole map fits the total budget
    pub fn prepare(&self, metadata: BlobMetadataMap) -> BlobMetadataMap {
        let mut prepared: BlobMetadataMap = metadata
            .into_iter()
            .map(|(key, value)| {
                let sanitized = sanitize_metadata_value(&value, self.max_value_length);
                if sanitized.truncated {
                    warn!(
                        key = %key,
                        original_len = value.len(),
                        max_len = self.max_value_length,
                        "Metadata value truncated"
                    );
                    metrics::counter!("classifier.metadata.truncated").increment(1);
                }
                (key, sanitized.value)
            })
            .collect();

        for (key, action) in fit_to_budget(&mut prepared, self.max_total_bytes) {
            warn!(
                key = %key,
                action = action.as_str(),
                budget = self.max_total_bytes,
                "Metadata key trimmed to fit blob metadata budget"
            );
            metrics::counter!("classifier.metadata.trimmed", "action" => action.as_str())
                .increment(1);
        }

        let total = metadata_size(&prepared);
        if total > self.max_total_bytes {
            warn!(
                total_bytes = total,
                budget = self.max_total_bytes,
                "Blob metadata still over budget after trimming"
            );
        }

        prepared
    }
}

/// Metadata describing a processed blob: identity, classification and the
/// event that triggered the run
pub fn enriched_metadata(
    event: &InboundEvent,
    file_id: &FileIdentity,
    file_name: &str,
    result: &ClassificationResult,
    processed_at: DateTime<Utc>,
) -> BlobMetadataMap {
    let mut metadata = BlobMetadataMap::new();

    metadata.insert(FILE_ID_KEY.to_string(), file_id.to_string());
    metadata.insert("classification".to_string(), result.classification.clone());
    metadata.insert(
        "confidence_score".to_string(),
        result.confidence_score.to_string(),
    );
    metadata.insert(
        "processed_at".to_string(),
        processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    metadata.insert("original_filename".to_string(), file_name.to_string());

    for key in CLASSIFICATION_DETAIL_KEYS {
        metadata.insert(key.to_string(), result.detail(key));
    }

    metadata.insert("cloud_event_id".to_string(), event.event_id.clone());
    metadata.insert("cloud_event_type".to_string(), event.event_type.clone());
    if let Some(time) = event.time {
        metadata.insert(
            "cloud_event_time".to_string(),
            time.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    if let Some(ref source) = event.source {
        metadata.insert("cloud_event_source".to_string(), source.clone());
    }

    let data = &event.data;
    if let Some(ref content_type) = data.content_type {
        metadata.insert("original_content_type".to_string(), content_type.clone());
    }
    if let Some(length) = data.content_length {
        metadata.insert("original_content_length".to_string(), length.to_string());
    }
    if let Some(ref etag) = data.etag {
        metadata.insert("original_etag".to_string(), etag.clone());
    }
    if let Some(ref api) = data.api {
        metadata.insert("blob_api".to_string(), api.clone());
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MockBlobStore;
    use crate::cloud_event::{decode, tests::blob_created_json};
    use crate::config::tests::test_config;
    use crate::identity::resolve_file_id;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_sanitize_strips_control_and_non_ascii() {
        let s = |v: &str| sanitize_metadata_value(v, 250).value;

        assert_eq!(s("Normal text"), "Normal text");
        assert_eq!(s("Text with\nnewlines\rand\ttabs"), "Text with newlines and tabs");
        assert_eq!(
            s("Text with special chars: !@#$%^&*()"),
            "Text with special chars: !@#$%^&*()"
        );
        assert_eq!(s("Text with unicode: éñüñ"), "Text with unicode:");
        assert_eq!(s("   Multiple   spaces   "), "Multiple spaces");
        assert_eq!(s("Control char: \x1f test"), "Control char: test");
        assert_eq!(s(""), "");
    }

    #[test]
    fn test_long_values_are_truncated_not_rejected() {
        let long = "Very long text ".repeat(50);
        let sanitized = sanitize_metadata_value(&long, 250);

        assert!(sanitized.truncated);
        assert_eq!(sanitized.value.len(), 250);
        assert!(sanitized.value.ends_with("..."));
        assert!(sanitized.value.starts_with("Very long text Very long text"));

        let exact = "x".repeat(250);
        assert!(!sanitize_metadata_value(&exact, 250).truncated);
    }

    #[test]
    fn test_merge_prefers_updates() {
        let existing = BlobMetadataMap::from([
            ("file_id".to_string(), "F-1".to_string()),
            ("classification".to_string(), "old".to_string()),
        ]);
        let updates = BlobMetadataMap::from([("classification".to_string(), "invoice".to_string())]);

        let merged = merge(existing, updates);
        assert_eq!(merged["file_id"], "F-1");
        assert_eq!(merged["classification"], "invoice");
    }

    #[tokio::test]
    async fn test_merge_and_write_reads_overlays_and_truncates() {
        let blob = BlobRef::new("stampedstorage", "report.pdf");
        let mut store = MockBlobStore::new();

        store.expect_get_metadata().times(1).returning(|_| {
            Ok(BlobMetadataMap::from([
                ("file_id".to_string(), "F-1".to_string()),
                ("uploaded_by".to_string(), "scanner-7".to_string()),
            ]))
        });
        store
            .expect_set_metadata()
            .times(1)
            .withf(|blob, metadata| {
                blob.name == "report.pdf"
                    && metadata["uploaded_by"] == "scanner-7"
                    && metadata["classification"] == "invoice"
                    && metadata["classifier_reasoning"].len() == 250
            })
            .returning(|_, _| Ok(()));

        let writer = BlobMetadataWriter::new(
            BoundedBlobStore::new(Arc::new(store), Duration::from_secs(5)),
            &test_config("http://classifier", "http://wmt/api/Transaction"),
        );

        let updates = BlobMetadataMap::from([
            ("classification".to_string(), "invoice".to_string()),
            ("classifier_reasoning".to_string(), "because ".repeat(100)),
        ]);
        let written = writer.merge_and_write(&blob, updates).await.unwrap();
        assert_eq!(written["file_id"], "F-1");
    }

    fn detail_heavy_metadata() -> BlobMetadataMap {
        // 10 + 21 + 270 + 269 = 570 bytes
        BlobMetadataMap::from([
            ("file_id".to_string(), "F-1".to_string()),
            ("classification".to_string(), "invoice".to_string()),
            ("classifier_reasoning".to_string(), "r".repeat(250)),
            ("classifier_keywords".to_string(), "k".repeat(250)),
        ])
    }

    #[test]
    fn test_fit_to_budget_shortens_lowest_priority_key_first() {
        let mut metadata = detail_heavy_metadata();

        let changed = fit_to_budget(&mut metadata, 470);

        assert_eq!(
            changed,
            vec![("classifier_reasoning".to_string(), BudgetAction::Shortened)]
        );
        assert_eq!(metadata_size(&metadata), 470);
        assert_eq!(metadata["classifier_reasoning"].len(), 150);
        assert!(metadata["classifier_reasoning"].ends_with("..."));
        assert_eq!(metadata["classifier_keywords"].len(), 250);
    }

    #[test]
    fn test_fit_to_budget_drops_keys_before_touching_identity() {
        let mut metadata = detail_heavy_metadata();

        let changed = fit_to_budget(&mut metadata, 200);

        assert_eq!(
            changed,
            vec![
                ("classifier_reasoning".to_string(), BudgetAction::Dropped),
                ("classifier_keywords".to_string(), BudgetAction::Shortened),
            ]
        );
        assert!(metadata_size(&metadata) <= 200);
        assert!(!metadata.contains_key("classifier_reasoning"));
        assert_eq!(metadata["file_id"], "F-1");
        assert_eq!(metadata["classification"], "invoice");
    }

    #[test]
    fn test_fit_to_budget_leaves_small_maps_alone() {
        let mut metadata = detail_heavy_metadata();
        assert!(fit_to_budget(&mut metadata, 2048).is_empty());
        assert_eq!(metadata, detail_heavy_metadata());
    }

    #[tokio::test]
    async fn test_merge_and_write_keeps_merged_map_within_budget() {
        let mut store = MockBlobStore::new();

        // Six uploader keys of 255 bytes each: 1530 bytes before our updates
        store.expect_get_metadata().times(1).returning(|_| {
            Ok((0..6)
                .map(|i| (format!("uploader_note_{i}"), "n".repeat(240)))
                .collect())
        });
        store
            .expect_set_metadata()
            .times(1)
            .withf(|_, metadata| {
                metadata_size(metadata) <= 2048
                    && metadata["classifier_reasoning"].ends_with("...")
                    && metadata["classifier_keywords"].len() == 250
                    && metadata["uploader_note_5"].len() == 240
                    && metadata["file_id"] == "F-1"
            })
            .returning(|_, _| Ok(()));

        let writer = BlobMetadataWriter::new(
            BoundedBlobStore::new(Arc::new(store), Duration::from_secs(5)),
            &test_config("http://classifier", "http://wmt/api/Transaction"),
        );

        let mut updates = detail_heavy_metadata();
        updates.insert("original_filename".to_string(), "report.pdf".to_string());
        let written = writer
            .merge_and_write(&BlobRef::new("stampedstorage", "report.pdf"), updates)
            .await
            .unwrap();

        assert_eq!(metadata_size(&written), 2048);
        assert_eq!(written["original_filename"], "report.pdf");
    }

    #[tokio::test]
    async fn test_merge_and_write_propagates_missing_blob() {
        let mut store = MockBlobStore::new();
        store
            .expect_get_metadata()
            .returning(|blob| Err(BlobAccessError::NotFound { blob: blob.clone() }));
        store.expect_set_metadata().never();

        let writer = BlobMetadataWriter::new(
            BoundedBlobStore::new(Arc::new(store), Duration::from_secs(5)),
            &test_config("http://classifier", "http://wmt/api/Transaction"),
        );

        let err = writer
            .merge_and_write(&BlobRef::new("stampedstorage", "gone.pdf"), BlobMetadataMap::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_enriched_metadata_keys() {
        let event = decode(blob_created_json("abc-123", "report.pdf").as_bytes()).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 31, 0).unwrap();
        let identity = resolve_file_id(None, Some("abc-123"), None, now).unwrap();
        let result = ClassificationResult::unclassified(serde_json::json!({}));

        let metadata = enriched_metadata(&event, &identity, "report.pdf", &result, now);

        assert_eq!(metadata["file_id"], "abc-123");
        assert_eq!(metadata["classification"], "unknown");
        assert_eq!(metadata["confidence_score"], "0");
        assert_eq!(metadata["processed_at"], "2024-01-15T10:31:00Z");
        assert_eq!(metadata["cloud_event_time"], "2024-01-15T10:30:00Z");
        assert_eq!(metadata["original_content_length"], "52431");
        assert_eq!(metadata["original_etag"], "0x8DC15F2A1B2C3D4");
        assert_eq!(metadata["blob_api"], "PutBlob");
        assert_eq!(metadata["subcategory"], "N/A");
    }
}
