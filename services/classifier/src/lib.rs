//! Classifier Service
//!
//! Document classification service for scanned PDFs. It consumes
//! blob-created CloudEvents from Kafka, sends each new PDF in the input
//! container to the classification API, records the result on the blob and
//! in result documents, and creates or updates the matching record in the
//! transaction API.
//!
//! ## Features
//!
//! - **Stable file identity**: the blob's own `file_id` metadata wins over
//!   the event id, so redeliveries update the same downstream record
//! - **Bounded runs**: every blob operation and HTTP call has its own budget,
//!   and the whole run has a deadline
//! - **Explicit delivery decisions**: each run returns whether its message
//!   should be acknowledged or redelivered
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic              Object Store                  HTTP APIs
//! ┌──────────────┐        ┌──────────────────┐         ┌──────────────┐
//! │ Blob-created │        │ stampedstorage   │         │ Classifier   │
//! │ events       │        │ classification.. │         └──────────────┘
//! └──────────────┘        │ resultstorage    │                ▲
//!        │                │ jsonfiles        │                │
//!        ▼                └──────────────────┘                │
//! ┌──────────────┐               ▲                            │
//! │ Kafka        │               │                            │
//! │ Consumer     │               │                            │
//! └──────────────┘               │                            │
//!        │ ▲ ack/redeliver       │                            │
//!        ▼ │                     │                            │
//! ┌──────────────┐        ┌──────────────┐                   │
//! │ Orchestrator │───────▶│ Blob Store + │                   │
//! │              │        │ Metadata     │                   │
//! │              │───────────────────────────────────────────┘
//! │              │        ┌──────────────┐
//! │              │───────▶│ Transaction  │
//! └──────────────┘        │ API          │
//!                         └──────────────┘
//! ```

pub mod blob_metadata;
pub mod blob_store;
pub mod classification_client;
pub mod cloud_event;
pub mod config;
pub mod documents;
pub mod error;
pub mod identity;
pub mod kafka_consumer;
pub mod orchestrator;
pub mod transaction_client;

pub use blob_metadata::{sanitize_metadata_value, BlobMetadataWriter};
pub use blob_store::{
    Blob, BlobAccessError, BlobMetadataMap, BlobRef, BlobStore, BoundedBlobStore, S3BlobStore,
};
pub use classification_client::{ClassificationApiError, ClassificationClient, ClassificationResult};
pub use cloud_event::{decode, InboundEvent, MalformedEventError};
pub use config::Config;
pub use documents::{ResultDocument, TransactionPayload};
pub use error::{CallFailureKind, Disposition, PipelineError};
pub use identity::{resolve_file_id, FileIdentity, IdentityResolutionError};
pub use kafka_consumer::{
    settle, ClassifierKafkaConsumer, DeliveryAction, MessagePosition, OffsetControl,
    RedeliveryTracker,
};
pub use orchestrator::{Orchestrator, Outcome, RunReport, SkipReason};
pub use transaction_client::{TransactionClient, UpsertError, UpsertOutcome, UpsertStage};
