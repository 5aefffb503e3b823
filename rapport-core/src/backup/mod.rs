//! Encrypted backup pipeline.
//!
//! `BackupOrchestrator` is the entry point. It drives the attachment
//! bundler, the metadata registry and retention, and reports progress
//! through a `ProgressReporter`.

pub mod attachments;
pub mod metadata;
pub mod models;
pub mod naming;
pub mod orchestrator;
pub mod progress;
pub mod retention;

pub use attachments::{AttachmentBundler, AttachmentPackage, AttachmentRestoreReport, BundleOutcome};
pub use metadata::{merge_registries, MetadataStore};
pub use models::{
    AttachmentLink, AttachmentRef, BackupDescriptor, BackupListing, BackupPayload, BackupReport, DeleteReport,
    DeviceClass, MetadataRegistry, RestoreReport, SoftFailure, SoftFailureKind, StageOutcome,
};
pub use naming::BackupNaming;
pub use orchestrator::{BackupOrchestrator, Collaborators, OperationState};
pub use progress::{ProgressEvent, ProgressReporter, ProgressSnapshot, SimulatedProgress};
pub use retention::{RetentionManager, RetentionReport};
