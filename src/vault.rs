//! Component wiring: one vault, its services, and its built-in task types.
//!
//! Everything that a framework would normally discover by annotation is
//! enumerated here explicitly: formats, task types, managed services. The
//! registries are plain values owned by the vault and passed by reference.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::VaultConfig;
use crate::db::Db;
use crate::error::{Result, VaultError};
use crate::format::FormatRegistry;
use crate::index::{Index, TenantRow};
use crate::ingest::{IngestPipeline, IngestReport};
use crate::object::{BinaryData, BlobRef, Buffer, ContentHash, Contents, TenantKey};
use crate::rebuild::{self, RebuildReport};
use crate::restore;
use crate::service::{ManagedService, Supervisor};
use crate::storage::{FsStorage, MemoryStorage, ObjectStorage};
use crate::task::{
    Outcome, Scheduler, TaskContext, TaskError, TaskRegistry, TaskStore, TaskType,
};
use crate::util;

/// Task type names, as recorded in the queue.
pub const TASK_INGEST: &str = "ingest_file";
pub const TASK_RECONSTRUCT: &str = "reconstruct";
pub const TASK_SQL_REBUILD: &str = "sql_rebuild";
pub const TASK_ENRICH: &str = "enrich";

/// Resource names used for admission control.
pub const RESOURCE_INGEST: &str = "ingest";
pub const RESOURCE_REBUILD: &str = "rebuild";

/// A running vault: storage, index, format registry, and ingest pipeline.
pub struct Vault {
    pub config: VaultConfig,
    pub db: Db,
    pub storage: Arc<dyn ObjectStorage>,
    pub index: Index,
    pub registry: Arc<FormatRegistry>,
    pub pipeline: Arc<IngestPipeline>,
}

impl Vault {
    /// Opens a vault on the filesystem paths named by `config`.
    pub async fn open(config: VaultConfig) -> Result<Arc<Self>> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Db::open(&config.db_path)?;
        let storage: Arc<dyn ObjectStorage> = Arc::new(
            FsStorage::open(&config.data_dir).map_err(|cause| VaultError::TaskExecutionFailed {
                retryable: false,
                cause,
            })?,
        );
        Self::build(config, db, storage).await
    }

    /// Opens a vault held entirely in memory, for tests and experiments.
    pub async fn open_ephemeral() -> Result<Arc<Self>> {
        let config = VaultConfig::default();
        let db = Db::open_in_memory()?;
        let storage: Arc<dyn ObjectStorage> = Arc::new(MemoryStorage::new());
        Self::build(config, db, storage).await
    }

    async fn build(
        config: VaultConfig,
        db: Db,
        storage: Arc<dyn ObjectStorage>,
    ) -> Result<Arc<Self>> {
        let index = Index::new(db.clone());
        index.init().await?;

        let registry = Arc::new(FormatRegistry::builtin());
        let pipeline = IngestPipeline::new(
            storage.clone(),
            index.clone(),
            registry.clone(),
            config.ingest_workers,
            config.ingest_queue_depth,
        );

        info!(workers = config.ingest_workers, "vault opened");
        Ok(Arc::new(Vault {
            config,
            db,
            storage,
            index,
            registry,
            pipeline,
        }))
    }

    /// Ingests a buffer for a tenant and waits for the full decomposition.
    pub async fn ingest(
        &self,
        tenant: TenantRow,
        buffer: Buffer,
        filename: String,
    ) -> std::result::Result<IngestReport, TaskError> {
        self.pipeline.ingest(tenant, buffer, filename).await
    }

    /// Reconstructs the original bytes for a stored container.
    pub async fn reconstruct(&self, tenant: &TenantKey, blob: &BlobRef) -> Result<Buffer> {
        restore::reconstruct(&self.storage, &self.registry, tenant, blob).await
    }

    /// Rebuilds the relational index from object storage.
    pub async fn rebuild_index(&self, truncate_first: bool) -> Result<RebuildReport> {
        rebuild::sql_rebuild(&self.storage, &self.index, &self.registry, truncate_first).await
    }

    /// Builds the registry of task types this vault can execute.
    pub fn task_registry(self: &Arc<Self>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();

        let vault = self.clone();
        registry.register(TaskType::new(
            TASK_INGEST,
            &[RESOURCE_INGEST],
            move |ctx| run_ingest(vault.clone(), ctx).boxed(),
        ));

        let vault = self.clone();
        registry.register(TaskType::new(TASK_RECONSTRUCT, &[], move |ctx| {
            run_reconstruct(vault.clone(), ctx).boxed()
        }));

        let vault = self.clone();
        registry.register(TaskType::new(
            TASK_SQL_REBUILD,
            &[RESOURCE_REBUILD],
            move |ctx| run_rebuild(vault.clone(), ctx).boxed(),
        ));

        let vault = self.clone();
        registry.register(TaskType::new(TASK_ENRICH, &[], move |ctx| {
            run_enrich(vault.clone(), ctx).boxed()
        }));

        registry
    }

    /// Builds a scheduler executing this vault's task types.
    pub async fn scheduler(self: &Arc<Self>, hostname: &str) -> Result<Scheduler> {
        let store = TaskStore::new(self.db.clone());
        store.init().await?;
        store
            .create_resource(RESOURCE_INGEST, self.config.ingest_concurrency)
            .await?;
        store.create_resource(RESOURCE_REBUILD, Some(1)).await?;

        Scheduler::new(store, self.task_registry(), &self.config, hostname).await
    }

    /// Builds the supervisor wiring this vault's managed services.
    ///
    /// Start order: database, storage, then the scheduler on top of both.
    pub fn supervisor(self: &Arc<Self>, scheduler: Scheduler) -> Supervisor {
        let mut supervisor = Supervisor::new();
        supervisor.register(Arc::new(DatabaseService { db: self.db.clone() }));
        supervisor.register(Arc::new(StorageService {
            storage: self.storage.clone(),
        }));
        supervisor.register(Arc::new(SchedulerService { scheduler }));
        supervisor
    }
}

struct DatabaseService {
    db: Db,
}

#[async_trait]
impl ManagedService for DatabaseService {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn do_start(&self) -> anyhow::Result<()> {
        self.db
            .with(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

struct StorageService {
    storage: Arc<dyn ObjectStorage>,
}

#[async_trait]
impl ManagedService for StorageService {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn do_start(&self) -> anyhow::Result<()> {
        self.storage.list_tenants().await?;
        Ok(())
    }
}

struct SchedulerService {
    scheduler: Scheduler,
}

#[async_trait]
impl ManagedService for SchedulerService {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["database", "storage"]
    }

    async fn do_start(&self) -> anyhow::Result<()> {
        self.scheduler.start().await;
        Ok(())
    }

    async fn do_stop(&self) -> anyhow::Result<()> {
        self.scheduler.shutdown().await;
        Ok(())
    }
}

/// Input of the `ingest_file` task.
#[derive(Debug, Deserialize, Serialize)]
pub struct IngestInput {
    pub tenant_id: i64,
    pub filename: String,
    /// Path of a local file to ingest.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Inline content as hex, mainly for tests and small payloads.
    #[serde(default)]
    pub content_hex: Option<String>,
}

/// Input of the `reconstruct` task.
#[derive(Debug, Deserialize, Serialize)]
pub struct ReconstructInput {
    pub tenant_id: i64,
    pub hash: ContentHash,
    pub leaf_size: u64,
    /// Where to write the reconstructed bytes, if anywhere.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

/// Input of the `sql_rebuild` task.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RebuildInput {
    #[serde(default)]
    pub truncate_first: bool,
}

/// Input of the `enrich` task.
#[derive(Debug, Deserialize, Serialize)]
pub struct EnrichInput {
    pub tenant_id: i64,
    pub hash: ContentHash,
    pub leaf_size: u64,
}

async fn load_tenant(vault: &Vault, tenant_id: i64) -> std::result::Result<TenantRow, TaskError> {
    vault
        .index
        .tenant_by_id(tenant_id)
        .await?
        .ok_or_else(|| TaskError::terminal(format!("tenant {} does not exist", tenant_id)))
}

async fn run_ingest(vault: Arc<Vault>, ctx: TaskContext) -> Outcome {
    let input: IngestInput = match ctx.input() {
        Ok(input) => input,
        Err(e) => return Outcome::Failed(TaskError::from(e)),
    };

    let result = async {
        let tenant = load_tenant(&vault, input.tenant_id).await?;

        let buffer = match (&input.path, &input.content_hex) {
            (Some(path), _) => {
                let mut contents = Contents::open(path).map_err(VaultError::from)?;
                let mut buffer = Buffer::with_threshold(vault.config.spill_threshold);
                std::io::copy(&mut contents, &mut buffer).map_err(VaultError::from)?;
                buffer
            }
            (None, Some(hex_text)) => {
                let bytes = hex::decode(hex_text)
                    .map_err(|e| TaskError::terminal(format!("bad content_hex: {}", e)))?;
                Buffer::from_bytes(bytes)
            }
            (None, None) => {
                return Err(TaskError::terminal(
                    "ingest input needs either path or content_hex",
                ))
            }
        };

        let report = vault.ingest(tenant, buffer, input.filename.clone()).await?;
        Ok(serde_json::to_value(report).expect("report serializes"))
    }
    .await;

    match result {
        Ok(output) => Outcome::Complete(output),
        Err(e) => Outcome::Failed(e),
    }
}

async fn run_reconstruct(vault: Arc<Vault>, ctx: TaskContext) -> Outcome {
    let input: ReconstructInput = match ctx.input() {
        Ok(input) => input,
        Err(e) => return Outcome::Failed(TaskError::from(e)),
    };

    let result = async {
        let tenant = load_tenant(&vault, input.tenant_id).await?;
        let container = BlobRef::container(input.hash, input.leaf_size);
        let mut restored = vault.reconstruct(&tenant.key(), &container).await?;

        if let Some(path) = &input.output_path {
            let mut file = std::fs::File::create(path).map_err(VaultError::from)?;
            std::io::Seek::seek(&mut restored, std::io::SeekFrom::Start(0))
                .map_err(VaultError::from)?;
            util::copy_wide(&mut restored, &mut file).map_err(VaultError::from)?;
        }

        Ok(serde_json::json!({
            "hash": input.hash,
            "leaf_size": restored.size(),
        }))
    }
    .await;

    match result {
        Ok(output) => Outcome::Complete(output),
        Err(e) => Outcome::Failed(e),
    }
}

async fn run_rebuild(vault: Arc<Vault>, ctx: TaskContext) -> Outcome {
    let input: RebuildInput = match ctx.input() {
        Ok(input) => input,
        Err(e) => return Outcome::Failed(TaskError::from(e)),
    };

    match vault.rebuild_index(input.truncate_first).await {
        Ok(report) => Outcome::Complete(serde_json::to_value(report).expect("report serializes")),
        Err(e) => Outcome::Failed(TaskError::from(e)),
    }
}

async fn run_enrich(vault: Arc<Vault>, ctx: TaskContext) -> Outcome {
    let input: EnrichInput = match ctx.input() {
        Ok(input) => input,
        Err(e) => return Outcome::Failed(TaskError::from(e)),
    };

    let result = async {
        let tenant = load_tenant(&vault, input.tenant_id).await?;
        let leaf = BlobRef::leaf(input.hash, input.leaf_size);
        let mut data = vault.storage.read(&tenant.key(), &leaf).await?;

        let header = data.read_header(8192).map_err(VaultError::from)?;
        let mime = FormatRegistry::sniff_mime(&header).map(str::to_owned);
        let format = vault.registry.detect(mime.as_deref(), "", &header)?;

        let text = format.extract_text(&mut *data)?;
        let metadata = format.extract_metadata(&mut *data, "")?;

        let ref_id = vault
            .index
            .find_or_insert_blob_ref(&leaf, mime.as_deref(), Some(format.name()))
            .await?;
        let blob_id = vault.index.find_or_insert_blob(tenant.id, ref_id).await?;
        vault
            .index
            .upsert_blob_content(blob_id, text.as_deref(), &Value::Object(metadata))
            .await?;

        Ok(serde_json::json!({ "blob_id": blob_id, "has_text": text.is_some() }))
    }
    .await;

    match result {
        Ok(output) => Outcome::Complete(output),
        Err(e) => Outcome::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::build_stored_zip;
    use crate::service::ServiceState;
    use crate::task::TaskHandle;
    use std::time::Duration;

    async fn vault_and_scheduler() -> (Arc<Vault>, Scheduler, TenantRow) {
        let vault = Vault::open_ephemeral().await.unwrap();
        let org = vault.index.find_or_insert_org("acme").await.unwrap();
        let tenant = vault.index.find_or_insert_tenant(org, "main").await.unwrap();
        let scheduler = vault.scheduler("test-node").await.unwrap();
        (vault, scheduler, tenant)
    }

    #[tokio::test]
    async fn ingest_task_end_to_end() {
        let (vault, scheduler, tenant) = vault_and_scheduler().await;
        scheduler.start().await;

        let zip = build_stored_zip(&[("a.txt", b"A"), ("b.txt", b"B")]);
        let input = IngestInput {
            tenant_id: tenant.id,
            filename: "simple.zip".into(),
            path: None,
            content_hex: Some(hex::encode(&zip)),
        };

        let mut handle: TaskHandle<IngestReport> = scheduler
            .submit_tracked(
                TASK_INGEST,
                serde_json::to_value(&input).unwrap(),
                Some(tenant.id),
            )
            .await
            .unwrap();
        let report = handle.wait(Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(report.blob_ref.is_container());

        // Reconstruct through the task surface too.
        let reconstruct_input = ReconstructInput {
            tenant_id: tenant.id,
            hash: report.blob_ref.hash,
            leaf_size: report.blob_ref.leaf_size,
            output_path: None,
        };
        let mut handle: TaskHandle<Value> = scheduler
            .submit_tracked(
                TASK_RECONSTRUCT,
                serde_json::to_value(&reconstruct_input).unwrap(),
                Some(tenant.id),
            )
            .await
            .unwrap();
        let output = handle.wait(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(output["leaf_size"], zip.len() as u64);

        scheduler.shutdown().await;
        let _ = vault;
    }

    #[tokio::test]
    async fn rebuild_task_restores_index() {
        let (vault, scheduler, tenant) = vault_and_scheduler().await;
        scheduler.start().await;

        vault
            .ingest(
                tenant.clone(),
                Buffer::from_bytes(b"leaf content".to_vec()),
                "note.txt".into(),
            )
            .await
            .unwrap();
        let before = vault.index.counts().await.unwrap();

        let mut handle: TaskHandle<RebuildReport> = scheduler
            .submit_tracked(
                TASK_SQL_REBUILD,
                serde_json::to_value(RebuildInput {
                    truncate_first: true,
                })
                .unwrap(),
                None,
            )
            .await
            .unwrap();
        handle.wait(Duration::from_secs(10)).await.unwrap().unwrap();

        assert_eq!(vault.index.counts().await.unwrap(), before);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn services_start_in_dependency_order() {
        let (vault, scheduler, _tenant) = vault_and_scheduler().await;
        let supervisor = vault.supervisor(scheduler);

        supervisor.start_all().await.unwrap();
        assert_eq!(supervisor.state("scheduler"), Some(ServiceState::Running));
        supervisor.stop_all().await;
        assert_eq!(supervisor.state("scheduler"), Some(ServiceState::Stopped));
    }

    #[tokio::test]
    async fn enrich_task_updates_blob_content() {
        let (vault, scheduler, tenant) = vault_and_scheduler().await;
        scheduler.start().await;

        let report = vault
            .ingest(
                tenant.clone(),
                Buffer::from_bytes(b"searchable words".to_vec()),
                "words.txt".into(),
            )
            .await
            .unwrap();

        let input = EnrichInput {
            tenant_id: tenant.id,
            hash: report.blob_ref.hash,
            leaf_size: report.blob_ref.leaf_size,
        };
        let mut handle: TaskHandle<Value> = scheduler
            .submit_tracked(TASK_ENRICH, serde_json::to_value(&input).unwrap(), None)
            .await
            .unwrap();
        let output = handle.wait(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(output["has_text"], true);

        scheduler.shutdown().await;
    }
}
