use crate::config::Config;
use crate::error::CallFailureKind;
use anyhow::Context;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Row fields of the detailed response formats and the keys they map to.
/// `Predicted Category` is handled separately.
const ROW_FIELDS: [(&str, &str); 9] = [
    ("Predicted Subcategory", "subcategory"),
    ("Expected Category", "expected_category"),
    ("Expected Subcategory", "expected_subcategory"),
    ("Evaluation Type", "evaluation_type"),
    ("Evaluation Verdict", "evaluation_verdict"),
    ("Evaluation Notes", "evaluation_notes"),
    ("Classifier Reasoning", "classifier_reasoning"),
    ("Classifier Keywords", "classifier_keywords"),
    ("File Name", "file_name"),
];

const PDF_CONTENT_TYPE: &str = "application/pdf";
const NOT_AVAILABLE: &str = "N/A";
const UNKNOWN_CLASSIFICATION: &str = "unknown";

#[derive(Error, Debug, Clone, PartialEq)]
#[error("classification call failed: {kind}: {detail}")]
pub struct ClassificationApiError {
    pub kind: CallFailureKind,
    pub detail: String,
}

impl ClassificationApiError {
    fn new(kind: CallFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// The service refused this document; resending it will not help
    pub fn is_content_rejection(&self) -> bool {
        match self.kind {
            CallFailureKind::HttpError { status } => {
                (400..500).contains(&status) && status != 408 && status != 429
            }
            _ => false,
        }
    }
}

/// Normalised outcome of one classification call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub classification: String,
    pub confidence_score: f64,
    /// Everything else the service reported, including `full_response`
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl ClassificationResult {
    /// Result for a response we could not interpret
    pub fn unclassified(response: Value) -> Self {
        let mut details = Map::new();
        details.insert("full_response".to_string(), response);
        Self {
            classification: UNKNOWN_CLASSIFICATION.to_string(),
            confidence_score: 0.0,
            details,
        }
    }

    /// A detail field rendered as text, `N/A` when absent
    pub fn detail(&self, key: &str) -> String {
        match self.details.get(key) {
            None | Some(Value::Null) => NOT_AVAILABLE.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// Numeric score from an evaluation verdict: `"7/10"` and `"7"` give 7,
/// anything else gives 0.
pub fn extract_confidence_score(verdict: &str) -> f64 {
    let verdict = verdict.trim();
    let numerator = match verdict.split_once('/') {
        Some((numerator, _)) => numerator.trim(),
        None => verdict,
    };

    match numerator.parse::<u32>() {
        Ok(score) => f64::from(score),
        Err(_) => {
            if !verdict.is_empty() && verdict != NOT_AVAILABLE {
                warn!(verdict = %verdict, "Could not parse confidence score");
            }
            0.0
        }
    }
}

/// Map any of the known response shapes onto a [`ClassificationResult`]
pub fn normalize_response(response: Value) -> ClassificationResult {
    let current_row = response
        .get("json")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .cloned();
    if let Some(row) = current_row {
        return from_row(&row, response);
    }

    let legacy_row = response
        .get("classification_result")
        .and_then(|r| r.get("json"))
        .and_then(Value::as_array)
        .map(|rows| rows.first().cloned().unwrap_or(Value::Object(Map::new())));
    if let Some(row) = legacy_row {
        return from_row(&row, response);
    }

    match response {
        Value::Object(mut fields) if fields.contains_key("classification") => {
            let classification = match fields.remove("classification") {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => UNKNOWN_CLASSIFICATION.to_string(),
                Some(other) => other.to_string(),
            };
            let confidence_score = match fields.remove("confidence_score") {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
                _ => 0.0,
            };
            ClassificationResult {
                classification,
                confidence_score,
                details: fields,
            }
        }
        other => {
            warn!(response = %other, "Unknown classification response format");
            ClassificationResult::unclassified(other)
        }
    }
}

fn from_row(row: &Value, full_response: Value) -> ClassificationResult {
    let text = |key: &str| match row.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };

    let mut details = Map::new();
    for (field, key) in ROW_FIELDS {
        let value = text(field).unwrap_or_else(|| NOT_AVAILABLE.to_string());
        details.insert(key.to_string(), Value::String(value));
    }

    let confidence_score = details
        .get("evaluation_verdict")
        .and_then(Value::as_str)
        .map(extract_confidence_score)
        .unwrap_or(0.0);
    details.insert("full_response".to_string(), full_response);

    ClassificationResult {
        classification: text("Predicted Category")
            .unwrap_or_else(|| UNKNOWN_CLASSIFICATION.to_string()),
        confidence_score,
        details,
    }
}

/// Client for the external document classification API
pub struct ClassificationClient {
    http: reqwest::Client,
    url: String,
    code: String,
}

impl ClassificationClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.classification_connect_timeout())
            .read_timeout(config.classification_read_timeout())
            .timeout(config.classification_timeout())
            .build()
            .context("Failed to build classification HTTP client")?;

        Ok(Self {
            http,
            url: config.classification_api_url.clone(),
            code: config.classification_api_code.clone(),
        })
    }

    /// Submit one PDF and normalise the answer
    #[instrument(skip(self, pdf), fields(file_name = %file_name, bytes = pdf.len()))]
    pub async fn classify(
        &self,
        pdf: Bytes,
        file_name: &str,
    ) -> Result<ClassificationResult, ClassificationApiError> {
        let start = Instant::now();
        let result = self.send(pdf, file_name).await;

        let label = match &result {
            Ok(_) => "success",
            Err(e) => e.kind.as_str(),
        };
        metrics::counter!("classifier.classifications", "result" => label).increment(1);
        metrics::histogram!("classifier.classification.duration_seconds")
            .record(start.elapsed().as_secs_f64());

        result
    }

    async fn send(
        &self,
        pdf: Bytes,
        file_name: &str,
    ) -> Result<ClassificationResult, ClassificationApiError> {
        let part = reqwest::multipart::Part::bytes(pdf.to_vec())
            .file_name(file_name.to_string())
            .headers(HeaderMap::from_iter([(
                CONTENT_TYPE,
                HeaderValue::from_static(PDF_CONTENT_TYPE),
            )]));
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut request = self.http.post(&self.url).multipart(form);
        if !self.code.is_empty() {
            request = request.query(&[("code", self.code.as_str())]);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "Classification API returned an error");
            return Err(ClassificationApiError::new(
                CallFailureKind::HttpError {
                    status: status.as_u16(),
                },
                body,
            ));
        }

        let body = response.text().await.map_err(transport_error)?;
        let json: Value = serde_json::from_str(&body).map_err(|e| {
            ClassificationApiError::new(
                CallFailureKind::InvalidResponse,
                format!("response is not JSON: {e}"),
            )
        })?;

        let empty = match &json {
            Value::Null => true,
            Value::Object(fields) => fields.is_empty(),
            Value::Array(rows) => rows.is_empty(),
            _ => false,
        };
        if empty {
            return Err(ClassificationApiError::new(
                CallFailureKind::InvalidResponse,
                "empty response body",
            ));
        }

        debug!(response_len = body.len(), "Classification response received");
        let result = normalize_response(json);
        info!(
            classification = %result.classification,
            confidence_score = result.confidence_score,
            "Document classified"
        );

        Ok(result)
    }
}

fn transport_error(err: reqwest::Error) -> ClassificationApiError {
    ClassificationApiError::new(CallFailureKind::from_reqwest(&err), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::error::PipelineError;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header_regex, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn detailed_row() -> Value {
        json!({
            "File Name": "report.pdf",
            "Predicted Category": "invoice",
            "Predicted Subcategory": "utility",
            "Expected Category": "invoice",
            "Evaluation Type": "auto",
            "Evaluation Verdict": "7/10",
            "Classifier Reasoning": "Contains an amount due",
            "Classifier Keywords": "total, due date"
        })
    }

    fn client_for(server: &MockServer) -> ClassificationClient {
        let config = test_config(&format!("{}/api/classify", server.uri()), "http://unused");
        ClassificationClient::new(&config).unwrap()
    }

    #[test]
    fn test_extract_confidence_score() {
        assert_eq!(extract_confidence_score("7/10"), 7.0);
        assert_eq!(extract_confidence_score(" 5 / 10 "), 5.0);
        assert_eq!(extract_confidence_score("7"), 7.0);
        assert_eq!(extract_confidence_score("N/A"), 0.0);
        assert_eq!(extract_confidence_score(""), 0.0);
        assert_eq!(extract_confidence_score("high"), 0.0);
    }

    #[test]
    fn test_normalize_detailed_formats() {
        let current = normalize_response(json!({ "json": [detailed_row()] }));
        assert_eq!(current.classification, "invoice");
        assert_eq!(current.confidence_score, 7.0);
        assert_eq!(current.detail("subcategory"), "utility");
        assert_eq!(current.detail("expected_subcategory"), "N/A");
        assert_eq!(current.details["full_response"]["json"][0]["File Name"], "report.pdf");

        let legacy = normalize_response(json!({ "classification_result": { "json": [detailed_row()] } }));
        assert_eq!(legacy.classification, "invoice");
        assert_eq!(legacy.detail("classifier_keywords"), "total, due date");

        let empty_rows = normalize_response(json!({ "classification_result": { "json": [] } }));
        assert_eq!(empty_rows.classification, "unknown");
        assert_eq!(empty_rows.confidence_score, 0.0);
    }

    #[test]
    fn test_normalize_simple_and_unknown_formats() {
        let simple = normalize_response(json!({
            "classification": "contract",
            "confidence_score": 0.92,
            "pages": 3
        }));
        assert_eq!(simple.classification, "contract");
        assert_eq!(simple.confidence_score, 0.92);
        assert_eq!(simple.detail("pages"), "3");

        let unknown = normalize_response(json!({ "label": "contract" }));
        assert_eq!(unknown.classification, "unknown");
        assert_eq!(unknown.details["full_response"]["label"], "contract");
    }

    #[test]
    fn test_serialized_result_is_flat() {
        let result = normalize_response(json!({ "json": [detailed_row()] }));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["classification"], "invoice");
        assert_eq!(value["confidence_score"], 7.0);
        assert_eq!(value["subcategory"], "utility");
    }

    #[test]
    fn test_content_rejection_statuses() {
        let err = |status| ClassificationApiError::new(CallFailureKind::HttpError { status }, "");
        assert!(err(400).is_content_rejection());
        assert!(err(415).is_content_rejection());
        assert!(!err(408).is_content_rejection());
        assert!(!err(429).is_content_rejection());
        assert!(!err(503).is_content_rejection());
        assert!(!ClassificationApiError::new(CallFailureKind::Timeout, "").is_content_rejection());
    }

    #[tokio::test]
    async fn test_classify_posts_multipart_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/classify"))
            .and(header_regex("content-type", "^multipart/form-data"))
            .and(|request: &Request| {
                let body = String::from_utf8_lossy(&request.body).to_ascii_lowercase();
                body.contains("filename=\"report.pdf\"")
                    && body.contains("content-type: application/pdf")
            })
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "json": [detailed_row()] })))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server)
            .classify(Bytes::from_static(b"%PDF-1.7"), "report.pdf")
            .await
            .unwrap();

        assert_eq!(result.classification, "invoice");
        assert_eq!(result.confidence_score, 7.0);
    }

    #[tokio::test]
    async fn test_classify_sends_function_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("code", "secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "classification": "memo" })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(&format!("{}/api/classify", server.uri()), "http://unused");
        config.classification_api_code = "secret-key".to_string();
        let client = ClassificationClient::new(&config).unwrap();

        let result = client.classify(Bytes::from_static(b"%PDF"), "memo.pdf").await.unwrap();
        assert_eq!(result.classification, "memo");
    }

    #[tokio::test]
    async fn test_error_statuses_map_to_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/classify"))
            .respond_with(ResponseTemplate::new(415).set_body_string("not a pdf"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .classify(Bytes::from_static(b"garbage"), "bad.pdf")
            .await
            .unwrap_err();

        assert_eq!(err.kind, CallFailureKind::HttpError { status: 415 });
        assert!(err.is_content_rejection());
        assert_eq!(err.detail, "not a pdf");
    }

    #[tokio::test]
    async fn test_server_error_is_not_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .classify(Bytes::from_static(b"%PDF"), "report.pdf")
            .await
            .unwrap_err();

        assert_eq!(err.kind, CallFailureKind::HttpError { status: 503 });
        assert!(!err.is_content_rejection());
    }

    #[tokio::test]
    async fn test_unusable_bodies_are_invalid_responses() {
        for body in ["<html>oops</html>", "{}", "null"] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;

            let err = client_for(&server)
                .classify(Bytes::from_static(b"%PDF"), "report.pdf")
                .await
                .unwrap_err();
            assert_eq!(err.kind, CallFailureKind::InvalidResponse, "body {body}");
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient_network_error() {
        // Bind then release a port so nothing is listening on it
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = test_config(&format!("http://127.0.0.1:{port}/api/classify"), "http://unused");
        let client = ClassificationClient::new(&config).unwrap();

        let err = client
            .classify(Bytes::from_static(b"%PDF"), "report.pdf")
            .await
            .unwrap_err();

        assert_eq!(err.kind, CallFailureKind::NetworkError);
        assert!(!err.is_content_rejection());
        assert!(PipelineError::from(err).is_transient());
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "classification": "late" }))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let mut config = test_config(&format!("{}/api/classify", server.uri()), "http://unused");
        config.classification_api_timeout = 1;
        let client = ClassificationClient::new(&config).unwrap();

        let err = client
            .classify(Bytes::from_static(b"%PDF"), "report.pdf")
            .await
            .unwrap_err();
        assert_eq!(err.kind, CallFailureKind::Timeout);
    }
}
