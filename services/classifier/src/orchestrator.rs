use crate::blob_metadata::{enriched_metadata, BlobMetadataWriter};
use crate::blob_store::{BlobMetadataMap, BlobRef, BlobStore, BoundedBlobStore};
use crate::classification_client::{ClassificationClient, ClassificationResult};
use crate::cloud_event::{self, InboundEvent};
use crate::config::Config;
use crate::documents::{
    classified_blob_name, metadata_document_name, parse_metadata_document, result_document_name,
    updated_metadata_document_name, PayloadContext, ResultDocument, TransactionPayload,
};
use crate::error::{Disposition, PipelineError};
use crate::identity::{resolve_file_id, FileIdentity, FILE_ID_KEY};
use crate::transaction_client::{TransactionClient, UpsertOutcome};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

const PDF_CONTENT_TYPE: &str = "application/pdf";
const JSON_CONTENT_TYPE: &str = "application/json";
const CLASSIFIED_MARKER: &str = "_classified";

/// Why an event was consumed without running the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Not a blob-created event
    EventType(String),
    /// Raised by a storage API we ignore, such as our own metadata rewrite
    IgnoredApi(String),
    NotPdf,
    /// One of our own classified copies
    AlreadyClassified,
    /// Blob lives outside the input container
    OtherContainer(String),
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::EventType(_) => "event_type",
            SkipReason::IgnoredApi(_) => "ignored_api",
            SkipReason::NotPdf => "not_pdf",
            SkipReason::AlreadyClassified => "already_classified",
            SkipReason::OtherContainer(_) => "other_container",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::EventType(t) => write!(f, "event type {t}"),
            SkipReason::IgnoredApi(api) => write!(f, "ignored api {api}"),
            SkipReason::NotPdf => f.write_str("not a pdf"),
            SkipReason::AlreadyClassified => f.write_str("already classified"),
            SkipReason::OtherContainer(c) => write!(f, "container {c}"),
        }
    }
}

/// Terminal state of one run
#[derive(Debug)]
pub enum Outcome {
    Processed {
        file_id: String,
        transaction: UpsertOutcome,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed(PipelineError),
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Processed { .. } | Outcome::Skipped { .. } => Disposition::Acknowledge,
            Outcome::Failed(e) => e.disposition(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Processed { .. } => "processed",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// What the delivery adapter gets back for one message
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: Outcome,
    pub disposition: Disposition,
}

/// Runs the classification pipeline for one inbound message
pub struct Orchestrator {
    config: Config,
    store: BoundedBlobStore,
    metadata: BlobMetadataWriter,
    classifier: ClassificationClient,
    transactions: TransactionClient,
}

impl Orchestrator {
    pub fn new(config: &Config, blob_store: Arc<dyn BlobStore>) -> anyhow::Result<Self> {
        let store = BoundedBlobStore::new(blob_store, config.blob_operation_timeout());

        Ok(Self {
            config: config.clone(),
            metadata: BlobMetadataWriter::new(store.clone(), config),
            store,
            classifier: ClassificationClient::new(config)?,
            transactions: TransactionClient::new(config)?,
        })
    }

    /// Handle one message body end to end, within the run deadline.
    ///
    /// Never fails: every error becomes an [`Outcome::Failed`] carrying the
    /// acknowledge/redeliver decision.
    pub async fn handle(&self, body: &[u8]) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, file_id = tracing::field::Empty);
        let start = Instant::now();
        let budget = self.config.max_timeout();

        let outcome = async {
            match tokio::time::timeout(budget, self.run(body)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => Outcome::Failed(e),
                Err(_) => Outcome::Failed(PipelineError::ProcessingTimeout { budget }),
            }
        }
        .instrument(span.clone())
        .await;

        let disposition = outcome.disposition();
        span.in_scope(|| match &outcome {
            Outcome::Processed {
                file_id,
                transaction,
            } => info!(
                file_id = %file_id,
                transaction = transaction.as_str(),
                "Run completed"
            ),
            Outcome::Skipped { reason } => {
                info!(reason = %reason, "Event skipped")
            }
            Outcome::Failed(e) => error!(
                stage = e.stage(),
                kind = e.kind(),
                disposition = disposition.as_str(),
                error = %e,
                "Run failed"
            ),
        });

        metrics::counter!("classifier.runs", "outcome" => outcome.label()).increment(1);
        metrics::histogram!("classifier.run.duration_seconds")
            .record(start.elapsed().as_secs_f64());

        RunReport {
            run_id,
            outcome,
            disposition,
        }
    }

    async fn run(&self, body: &[u8]) -> Result<Outcome, PipelineError> {
        let event = cloud_event::decode(body)?;
        debug!(event_id = %event.event_id, subject = %event.subject, "Event decoded");

        if let Some(reason) = self.skip_event(&event) {
            return Ok(Outcome::Skipped { reason });
        }
        let blob = event.blob_ref()?;
        if let Some(reason) = self.skip_blob(&blob) {
            return Ok(Outcome::Skipped { reason });
        }
        let file_name = blob.file_name().to_string();

        let source = self.store.get_blob(&blob).await?;
        let now = Utc::now();
        let identity = resolve_file_id(
            Some(&source.metadata),
            Some(&event.event_id),
            Some(&file_name),
            now,
        )?;
        Span::current().record("file_id", identity.as_str());
        info!(
            blob = %blob,
            identity_source = identity.source().as_str(),
            size_bytes = source.content.len(),
            "Processing blob"
        );

        let classification = self
            .classifier
            .classify(source.content.clone(), &file_name)
            .await?;

        let enriched = enriched_metadata(&event, &identity, &file_name, &classification, now);
        self.metadata.merge_and_write(&blob, enriched.clone()).await?;

        let classified = BlobRef::new(
            self.config.classification_container.as_str(),
            classified_blob_name(&file_name, &classification.classification),
        );
        self.store
            .put_blob(
                &classified,
                source.content.clone(),
                PDF_CONTENT_TYPE,
                self.metadata.prepare(enriched),
            )
            .await?;

        let result_document = ResultDocument::new(
            &file_name,
            identity.as_str(),
            &classification,
            &source.metadata,
            &event,
            now,
        );
        self.put_json(
            &self.config.results_container,
            result_document_name(&file_name),
            serde_json::to_vec_pretty(&result_document)?,
            &identity,
            &classification,
            now,
        )
        .await?;

        let document = self.load_metadata_document(&identity).await?;
        let refreshed = document.is_some();
        let source_url = self.store.url(&blob);
        let classified_url = self.store.url(&classified);
        let container_url = self
            .store
            .container_url(&self.config.classification_container);
        let ctx = PayloadContext {
            file_id: identity.as_str(),
            file_name: &file_name,
            classification: &classification,
            source_url: &source_url,
            classified_url: &classified_url,
            classification_container_url: &container_url,
            config: &self.config,
            now,
        };
        let payload = TransactionPayload::from_document(document, &ctx);

        if refreshed {
            let content = Bytes::from(serde_json::to_vec_pretty(&payload)?);
            self.put_json(
                &self.config.metadata_container,
                metadata_document_name(identity.as_str()),
                content.clone(),
                &identity,
                &classification,
                now,
            )
            .await?;
            self.put_json(
                &self.config.results_container,
                updated_metadata_document_name(identity.as_str()),
                content,
                &identity,
                &classification,
                now,
            )
            .await?;
            info!("Metadata document refreshed");
        }

        let transaction = self.transactions.upsert(&payload).await?;

        Ok(Outcome::Processed {
            file_id: identity.to_string(),
            transaction,
        })
    }

    fn skip_event(&self, event: &InboundEvent) -> Option<SkipReason> {
        if event.event_type != self.config.blob_created_event_type {
            return Some(SkipReason::EventType(event.event_type.clone()));
        }

        match event.data.api {
            Some(ref api) if self.config.ignored_event_apis.iter().any(|a| a == api) => {
                Some(SkipReason::IgnoredApi(api.clone()))
            }
            _ => None,
        }
    }

    fn skip_blob(&self, blob: &BlobRef) -> Option<SkipReason> {
        let file_name = blob.file_name().to_ascii_lowercase();

        if !file_name.ends_with(".pdf") {
            Some(SkipReason::NotPdf)
        } else if file_name.contains(CLASSIFIED_MARKER) {
            Some(SkipReason::AlreadyClassified)
        } else if blob.container != self.config.input_container {
            Some(SkipReason::OtherContainer(blob.container.clone()))
        } else {
            None
        }
    }

    /// The per-file metadata document, if one exists and parses
    async fn load_metadata_document(
        &self,
        identity: &FileIdentity,
    ) -> Result<Option<Map<String, Value>>, PipelineError> {
        let blob = BlobRef::new(
            self.config.metadata_container.as_str(),
            metadata_document_name(identity.as_str()),
        );

        match self.store.get_blob(&blob).await {
            Ok(document) => match parse_metadata_document(&document.content) {
                Ok(fields) => Ok(Some(fields)),
                Err(e) => {
                    warn!(blob = %blob, error = %e, "Metadata document is not a JSON object, ignoring");
                    Ok(None)
                }
            },
            Err(e) if e.is_not_found() => {
                debug!(blob = %blob, "No metadata document");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put_json(
        &self,
        container: &str,
        name: String,
        content: impl Into<Bytes>,
        identity: &FileIdentity,
        classification: &ClassificationResult,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let blob = BlobRef::new(container, name);
        let metadata = BlobMetadataMap::from([
            (FILE_ID_KEY.to_string(), identity.to_string()),
            (
                "classification".to_string(),
                classification.classification.clone(),
            ),
            (
                "updated_at".to_string(),
                now.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ]);

        self.store
            .put_blob(
                &blob,
                content.into(),
                JSON_CONTENT_TYPE,
                self.metadata.prepare(metadata),
            )
            .await?;

        debug!(blob = %blob, "JSON document written");
        Ok(())
    }
}
