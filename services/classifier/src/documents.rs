//! JSON documents produced by a run: the transaction payload (which is also
//! the refreshed per-file metadata document) and the classification result
//! document, plus the blob names they are stored under.

use crate::blob_store::BlobMetadataMap;
use crate::classification_client::ClassificationResult;
use crate::cloud_event::InboundEvent;
use crate::config::Config;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;

const FILE_TYPE_PDF: &str = "PDF";
const RESULT_DOCUMENT_VERSION: &str = "1.0";
const RESULT_DOCUMENT_SOURCE: &str = "classifier-service";

/// Page-number arrays kept from an existing document; initialised when absent
const PRESERVED_TEMPLATE_ARRAYS: [&str; 3] = [
    "extracted_page_numbers_from_ocr",
    "manually_selected_page_numbers_by_user",
    "enhanced_split_identifiers_by_range",
];

/// Record sent to the transaction API.
///
/// Typed fields are always overwritten by a run; anything else found in an
/// existing metadata document is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub file_id: String,
    pub client_name: String,
    pub client_id: i64,
    pub process_code: String,
    pub org_id: i64,
    pub status: i64,
    pub file_type: String,
    pub file_open_date: String,
    pub file_receive_date: String,
    pub file_completion_date: String,
    pub date_created: String,
    #[serde(default)]
    pub template_info: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Everything a run knows that goes into the payload
pub struct PayloadContext<'a> {
    pub file_id: &'a str,
    pub file_name: &'a str,
    pub classification: &'a ClassificationResult,
    /// URL of the source PDF
    pub source_url: &'a str,
    /// URL of the classified copy
    pub classified_url: &'a str,
    /// URL of the classification container, with a trailing `/`
    pub classification_container_url: &'a str,
    pub config: &'a Config,
    pub now: DateTime<Utc>,
}

impl TransactionPayload {
    /// Build the payload from an existing metadata document, or from
    /// defaults when there is none.
    pub fn from_document(document: Option<Map<String, Value>>, ctx: &PayloadContext<'_>) -> Self {
        let mut document = document.unwrap_or_default();

        let client_name = match document.remove("client_name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name,
            _ => ctx.file_name.to_string(),
        };
        let mut template_info = match document.remove("template_info") {
            Some(Value::Object(info)) => info,
            _ => Map::new(),
        };
        refresh_template_info(&mut template_info, ctx);

        for key in [
            "file_id",
            "client_id",
            "process_code",
            "org_id",
            "status",
            "file_type",
            "file_open_date",
            "file_receive_date",
            "file_completion_date",
            "date_created",
        ] {
            document.remove(key);
        }

        let now = ctx.now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let config = ctx.config;

        Self {
            file_id: ctx.file_id.to_string(),
            client_name,
            client_id: config.client_id,
            process_code: config.process_code.clone(),
            org_id: config.org_id,
            status: config.status,
            file_type: FILE_TYPE_PDF.to_string(),
            file_open_date: now.clone(),
            file_receive_date: now.clone(),
            file_completion_date: now.clone(),
            date_created: now,
            template_info,
            extra: document,
        }
    }
}

fn refresh_template_info(info: &mut Map<String, Value>, ctx: &PayloadContext<'_>) {
    let config = ctx.config;
    let updates = [
        (
            "system_identified_document_category",
            json!(ctx.classification.classification),
        ),
        ("user_selected_document_category", json!("")),
        (
            "category_confidence_score",
            json!(ctx.classification.confidence_score),
        ),
        ("original_bulkscan_pdf_url", json!(ctx.source_url)),
        ("extracted_split_pdf_file_url", json!(ctx.classified_url)),
        ("stamped_split_pdf_file_url", json!(ctx.source_url)),
        (
            "output_split_files_container_name",
            json!(ctx.classification_container_url),
        ),
        ("stamped_documents_container_name", json!(config.input_container)),
        (
            "document_classification_container_name",
            json!(config.classification_container),
        ),
        ("split_identifiers_provided_by_user", json!([])),
        ("classification_identifiers_provided_by_user", json!([])),
    ];
    for (key, value) in updates {
        info.insert(key.to_string(), value);
    }

    for key in PRESERVED_TEMPLATE_ARRAYS {
        info.entry(key).or_insert_with(|| json!([]));
    }
}

/// Parse a stored metadata document; only JSON objects are accepted
pub fn parse_metadata_document(content: &[u8]) -> Result<Map<String, Value>, serde_json::Error> {
    serde_json::from_slice(content)
}

#[derive(Debug, Serialize)]
pub struct ResultMetadata<'a> {
    pub version: &'static str,
    pub source: &'static str,
    pub file_id: &'a str,
}

/// Per-file record of one classification, written to the results container
#[derive(Debug, Serialize)]
pub struct ResultDocument<'a> {
    pub original_filename: &'a str,
    pub processed_at: DateTime<Utc>,
    pub file_id: &'a str,
    pub classification_result: &'a ClassificationResult,
    pub original_blob_metadata: &'a BlobMetadataMap,
    pub cloud_event: &'a InboundEvent,
    pub metadata: ResultMetadata<'a>,
}

impl<'a> ResultDocument<'a> {
    pub fn new(
        file_name: &'a str,
        file_id: &'a str,
        classification_result: &'a ClassificationResult,
        original_blob_metadata: &'a BlobMetadataMap,
        cloud_event: &'a InboundEvent,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            original_filename: file_name,
            processed_at,
            file_id,
            classification_result,
            original_blob_metadata,
            cloud_event,
            metadata: ResultMetadata {
                version: RESULT_DOCUMENT_VERSION,
                source: RESULT_DOCUMENT_SOURCE,
                file_id,
            },
        }
    }
}

fn split_file_name(file_name: &str) -> (&str, String) {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    (stem, extension)
}

/// `{stem}_classified_{classification}{ext}`
pub fn classified_blob_name(file_name: &str, classification: &str) -> String {
    let (stem, extension) = split_file_name(file_name);
    format!(
        "{stem}_classified_{}{extension}",
        sanitize_path_component(classification)
    )
}

/// `{stem}_classification_result.json`
pub fn result_document_name(file_name: &str) -> String {
    let (stem, _) = split_file_name(file_name);
    format!("{stem}_classification_result.json")
}

pub fn metadata_document_name(file_id: &str) -> String {
    format!("{file_id}.json")
}

pub fn updated_metadata_document_name(file_id: &str) -> String {
    format!("{file_id}_updated_metadata.json")
}

/// Sanitize a label for use in a blob name
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use chrono::TimeZone;

    pub(crate) fn sample_payload(file_id: &str) -> TransactionPayload {
        let config = test_config("http://classifier", "http://wmt/api/Transaction");
        let classification = ClassificationResult::unclassified(json!({}));
        let ctx = PayloadContext {
            file_id,
            file_name: "report.pdf",
            classification: &classification,
            source_url: "https://acct/stampedstorage/report.pdf",
            classified_url: "https://acct/classificationstorage/report_classified_unknown.pdf",
            classification_container_url: "https://acct/classificationstorage/",
            config: &config,
            now: Utc.with_ymd_and_hms(2024, 1, 15, 10, 31, 0).unwrap(),
        };
        TransactionPayload::from_document(None, &ctx)
    }

    #[test]
    fn test_blob_names() {
        assert_eq!(
            classified_blob_name("report.pdf", "invoice"),
            "report_classified_invoice.pdf"
        );
        assert_eq!(
            classified_blob_name("Q1 report.pdf", "bank statement/2024"),
            "Q1 report_classified_bank_statement_2024.pdf"
        );
        assert_eq!(
            result_document_name("report.pdf"),
            "report_classification_result.json"
        );
        assert_eq!(metadata_document_name("abc-123"), "abc-123.json");
        assert_eq!(
            updated_metadata_document_name("abc-123"),
            "abc-123_updated_metadata.json"
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("invoice"), "invoice");
        assert_eq!(sanitize_path_component("a/b"), "a_b");
        assert_eq!(sanitize_path_component("dev..ice"), "dev__ice");
        assert_eq!(sanitize_path_component("hello world"), "hello_world");
    }

    #[test]
    fn test_default_payload() {
        let payload = sample_payload("abc-123");

        assert_eq!(payload.file_id, "abc-123");
        assert_eq!(payload.client_name, "report.pdf");
        assert_eq!(payload.client_id, 714);
        assert_eq!(payload.process_code, "715");
        assert_eq!(payload.org_id, 4);
        assert_eq!(payload.status, 1);
        assert_eq!(payload.file_type, "PDF");
        assert_eq!(payload.date_created, "2024-01-15T10:31:00Z");
        assert_eq!(
            payload.template_info["system_identified_document_category"],
            "unknown"
        );
        assert_eq!(
            payload.template_info["stamped_documents_container_name"],
            "stampedstorage"
        );
        assert_eq!(payload.template_info["extracted_page_numbers_from_ocr"], json!([]));
    }

    #[test]
    fn test_existing_document_is_refreshed_not_replaced() {
        let config = test_config("http://classifier", "http://wmt/api/Transaction");
        let classification = ClassificationResult {
            classification: "invoice".to_string(),
            confidence_score: 7.0,
            details: Map::new(),
        };
        let ctx = PayloadContext {
            file_id: "F-0042",
            file_name: "report.pdf",
            classification: &classification,
            source_url: "https://acct/stampedstorage/report.pdf",
            classified_url: "https://acct/classificationstorage/report_classified_invoice.pdf",
            classification_container_url: "https://acct/classificationstorage/",
            config: &config,
            now: Utc.with_ymd_and_hms(2024, 1, 15, 10, 31, 0).unwrap(),
        };

        let document = parse_metadata_document(
            json!({
                "file_id": "F-0042",
                "client_name": "Acme Corp",
                "status": 9,
                "batch_number": "B-17",
                "template_info": {
                    "extracted_page_numbers_from_ocr": [1, 2],
                    "split_identifiers_provided_by_user": ["old"],
                    "system_identified_document_category": "memo"
                }
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();

        let payload = TransactionPayload::from_document(Some(document), &ctx);
        assert_eq!(payload.client_name, "Acme Corp");
        assert_eq!(payload.status, 1);
        assert_eq!(payload.extra["batch_number"], "B-17");

        let info = &payload.template_info;
        assert_eq!(info["system_identified_document_category"], "invoice");
        assert_eq!(info["category_confidence_score"], json!(7.0));
        assert_eq!(info["extracted_page_numbers_from_ocr"], json!([1, 2]));
        assert_eq!(info["split_identifiers_provided_by_user"], json!([]));
        assert_eq!(info["enhanced_split_identifiers_by_range"], json!([]));

        let serialized = serde_json::to_value(&payload).unwrap();
        assert_eq!(serialized["batch_number"], "B-17");
        assert_eq!(serialized["file_id"], "F-0042");
    }

    #[test]
    fn test_non_object_metadata_document_is_rejected() {
        assert!(parse_metadata_document(b"[1, 2, 3]").is_err());
        assert!(parse_metadata_document(b"{not json").is_err());
    }
}
