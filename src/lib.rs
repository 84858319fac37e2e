//! Multi-tenant content-addressed archive vault.
//!
//! Files are decomposed into a recursive tree of content-addressed blobs:
//! archives become manifests plus children, everything else becomes a leaf.
//! Blobs live in tenant-scoped object storage, an SQL index mirrors their
//! relationships, and a durable task queue drives ingest, reconstruction,
//! and index rebuilds across nodes. Lossless containers can be reassembled
//! byte-for-byte from their pieces.

pub use crate::config::VaultConfig;
pub use crate::error::{Result, VaultError};
pub use crate::format::{
    Capability, ContainerChild, DetectionCriteria, Extraction, Format, FormatRegistry,
    RestoredChild,
};
pub use crate::index::{Index, TenantRow};
pub use crate::ingest::{IngestPipeline, IngestReport};
pub use crate::manifest::{Manifest, ManifestEntry};
pub use crate::object::{
    BinaryData, BlobKind, BlobRef, Buffer, ContentHash, Contents, EntryType, HashWriter, Hasher,
    TenantKey,
};
pub use crate::rebuild::RebuildReport;
pub use crate::service::{
    spawn_cascade_observer, ManagedService, ServiceState, ServiceStateChanged, Supervisor,
};
pub use crate::storage::{FsStorage, MemoryStorage, ObjectStorage};
pub use crate::task::{
    Outcome, Scheduler, TaskContext, TaskError, TaskHandle, TaskRegistry, TaskRow, TaskStatus,
    TaskStore, TaskType,
};
pub use crate::vault::Vault;

pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod index;
pub mod ingest;
pub mod manifest;
pub mod object;
pub mod rebuild;
pub mod restore;
pub mod service;
pub mod storage;
pub mod task;
pub mod vault;

mod util;
