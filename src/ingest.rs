//! Event-driven ingest pipeline.
//!
//! A file enters as a single event. Leaves are hashed, stored, and indexed
//! in place; containers fan out one event per extracted child and a
//! `FanInContext` counts them back in. The worker that records the last
//! child result is the unique assembler: it encodes the manifest, stores it,
//! writes the container's index rows, and signals the parent context, so a
//! manifest is never observable before every blob it references has been
//! committed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, instrument, trace};

use crate::error::VaultError;
use crate::format::{Capability, ContainerChild, Extraction, Format, FormatRegistry};
use crate::index::{Index, NewEntry, TenantRow};
use crate::manifest::{Manifest, ManifestEntry};
use crate::object::{BinaryData, BlobRef, Buffer, ContentHash, EntryType};
use crate::storage::ObjectStorage;
use crate::task::TaskError;

/// What an ingest produced for the root file.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct IngestReport {
    /// Identity the root file ended up under: its container ref when the
    /// file was losslessly decomposed, else its leaf ref.
    pub blob_ref: BlobRef,
    /// The tenant's ownership row for that ref.
    pub blob_id: i64,
}

/// Position of a child within its parent's fan-in.
struct ParentLink {
    ctx: Arc<FanInContext>,
    slot: usize,
    info: ChildInfo,
}

/// The parts of an extracted child echoed into manifests and index rows.
#[derive(Clone, Debug)]
struct ChildInfo {
    path: String,
    entry_type: EntryType,
    mtime_millis: Option<i64>,
    metadata: Vec<u8>,
}

impl ChildInfo {
    fn of(child: &ContainerChild) -> Self {
        ChildInfo {
            path: child.path.clone(),
            entry_type: child.entry_type,
            mtime_millis: child.mtime_millis,
            metadata: child.metadata.clone(),
        }
    }
}

/// A fully-ingested child, as collected by the fan-in.
struct ChildResult {
    info: ChildInfo,
    blob_ref: BlobRef,
    blob_id: i64,
}

/// Everything the unique assembler needs once all children are in.
struct AssemblySeed {
    tenant: TenantRow,
    original_hash: ContentHash,
    original_size: u64,
    format_id: u16,
    handler: &'static str,
    capability: Capability,
    container_meta: Vec<u8>,
    mime: Option<String>,
    /// Set when this container is the ingest root (its assembly reports the
    /// final outcome).
    is_root: bool,
}

/// Per-container coordination: counts outstanding children and collects
/// their results in extraction order.
struct FanInContext {
    remaining: AtomicUsize,
    slots: Mutex<Vec<Option<ChildResult>>>,
    parent: Option<ParentLink>,
    seed: AssemblySeed,
}

impl FanInContext {
    /// Records a child result. Returns `true` for exactly one caller: the
    /// one that observed the counter reach zero and must assemble.
    fn add_result(&self, slot: usize, result: ChildResult) -> bool {
        {
            let mut slots = self.slots.lock().expect("fan-in slots poisoned");
            debug_assert!(slots[slot].is_none(), "child slot filled twice");
            slots[slot] = Some(result);
        }
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn take_results(&self) -> Vec<ChildResult> {
        let mut slots = self.slots.lock().expect("fan-in slots poisoned");
        slots
            .iter_mut()
            .map(|slot| slot.take().expect("assembling with missing child"))
            .collect()
    }
}

/// Tracks one whole ingest: outstanding events, first failure, and the
/// root outcome.
struct RootContext {
    outstanding: AtomicUsize,
    failure: Mutex<Option<TaskError>>,
    outcome: Mutex<Option<IngestReport>>,
    done: Notify,
}

impl RootContext {
    fn new() -> Self {
        RootContext {
            outstanding: AtomicUsize::new(0),
            failure: Mutex::new(None),
            outcome: Mutex::new(None),
            done: Notify::new(),
        }
    }

    fn add(&self, n: usize) {
        self.outstanding.fetch_add(n, Ordering::AcqRel);
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.notify_waiters();
        }
    }

    fn fail(&self, error: TaskError) {
        let mut failure = self.failure.lock().expect("failure slot poisoned");
        failure.get_or_insert(error);
    }

    fn failed(&self) -> bool {
        self.failure.lock().expect("failure slot poisoned").is_some()
    }

    fn set_outcome(&self, report: IngestReport) {
        let mut outcome = self.outcome.lock().expect("outcome slot poisoned");
        *outcome = Some(report);
    }

    async fn wait(&self) -> Result<IngestReport, TaskError> {
        loop {
            let notified = self.done.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }

        if let Some(error) = self.failure.lock().expect("failure slot poisoned").take() {
            return Err(error);
        }
        self.outcome
            .lock()
            .expect("outcome slot poisoned")
            .take()
            .ok_or_else(|| TaskError::terminal("ingest finished without an outcome"))
    }
}

/// One unit of pipeline work: ingest these bytes under this name.
struct IngestEvent {
    tenant: TenantRow,
    buffer: Buffer,
    filename: String,
    /// Present when these bytes are a child of a container being assembled.
    fan_in: Option<(Arc<FanInContext>, usize, ChildInfo)>,
    /// A bonus pass decomposes bytes whose leaf is already stored; it
    /// produces the manifest but signals nobody.
    bonus: bool,
    root: Arc<RootContext>,
}

struct PipelineShared {
    storage: Arc<dyn ObjectStorage>,
    index: Index,
    registry: Arc<FormatRegistry>,
    events: mpsc::Sender<IngestEvent>,
}

/// The ingest pipeline: a bounded event queue and its worker pool.
pub struct IngestPipeline {
    shared: Arc<PipelineShared>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IngestPipeline {
    /// Builds a pipeline and spawns its workers.
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        index: Index,
        registry: Arc<FormatRegistry>,
        workers: usize,
        queue_depth: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let shared = Arc::new(PipelineShared {
            storage,
            index,
            registry,
            events: tx,
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let shared = shared.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let event = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match event {
                        Some(event) => process_event(&shared, event).await,
                        None => break,
                    }
                }
            }));
        }

        Arc::new(IngestPipeline {
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Ingests one file for a tenant and waits for the whole decomposition
    /// tree to commit.
    #[instrument(skip_all, fields(tenant = tenant.id, filename = %filename))]
    pub async fn ingest(
        &self,
        tenant: TenantRow,
        buffer: Buffer,
        filename: String,
    ) -> Result<IngestReport, TaskError> {
        let root = Arc::new(RootContext::new());
        root.add(1);

        let event = IngestEvent {
            tenant,
            buffer,
            filename,
            fan_in: None,
            bonus: false,
            root: root.clone(),
        };
        self.shared
            .events
            .send(event)
            .await
            .map_err(|_| TaskError::terminal("ingest pipeline is shut down"))?;

        root.wait().await
    }

    /// Stops the workers once queued events drain.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("worker list poisoned");
            workers.drain(..).collect()
        };
        // Workers exit when the last sender is gone; the shared sender lives
        // as long as self, so abort instead of waiting forever.
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn process_event(shared: &Arc<PipelineShared>, event: IngestEvent) {
    let root = event.root.clone();
    if root.failed() {
        root.finish_one();
        return;
    }

    if let Err(error) = handle_event(shared, event).await {
        root.fail(error);
    }
    root.finish_one();
}

async fn handle_event(
    shared: &Arc<PipelineShared>,
    mut event: IngestEvent,
) -> Result<(), TaskError> {
    let hash = event.buffer.hash().map_err(VaultError::from)?;
    let size = event.buffer.size();
    let leaf_ref = BlobRef::leaf(hash, size);

    let header = event.buffer.read_header(8192).map_err(VaultError::from)?;
    let mime = FormatRegistry::sniff_mime(&header).map(str::to_owned);
    let format = shared
        .registry
        .detect(mime.as_deref(), &event.filename, &header)?;

    trace!(
        hash = %hash,
        size,
        format = format.name(),
        bonus = event.bonus,
        "ingesting"
    );

    let extraction = if format.is_container() {
        format.extract_children(&mut event.buffer)?
    } else {
        Extraction::leaf()
    };

    match extraction.capability {
        Capability::Leaf => {
            let blob_id = store_leaf(shared, &leaf_ref, &mut event, mime.as_deref(), &*format).await?;
            conclude_leaf(shared, &event, leaf_ref, blob_id).await
        }

        Capability::Reconstructable if !event.bonus => {
            // Lossless decomposition: the original bytes are not retained,
            // only the manifest will be.
            fan_out(shared, event, extraction, &*format, hash, size, mime).await
        }

        Capability::Stored if !event.bonus => {
            // The original stays a leaf; parents reference that leaf. The
            // manifest is produced by a bonus pass over the same bytes.
            let blob_id = store_leaf(shared, &leaf_ref, &mut event, mime.as_deref(), &*format).await?;
            conclude_leaf(shared, &event, leaf_ref, blob_id).await?;

            event.root.add(1);
            let bonus = IngestEvent {
                tenant: event.tenant,
                buffer: event.buffer,
                filename: event.filename,
                fan_in: None,
                bonus: true,
                root: event.root,
            };
            enqueue(shared, bonus);
            Ok(())
        }

        // A bonus pass decomposes regardless of tier.
        _ => fan_out(shared, event, extraction, &*format, hash, size, mime).await,
    }
}

/// Stores a leaf blob, records its index rows, and attaches enrichment.
async fn store_leaf(
    shared: &Arc<PipelineShared>,
    leaf_ref: &BlobRef,
    event: &mut IngestEvent,
    mime: Option<&str>,
    format: &dyn Format,
) -> Result<i64, TaskError> {
    let tenant = event.tenant.clone();
    shared
        .storage
        .write(&tenant.key(), leaf_ref, &mut event.buffer, mime)
        .await?;

    let ref_id = shared
        .index
        .find_or_insert_blob_ref(leaf_ref, mime, Some(format.name()))
        .await?;
    let blob_id = shared.index.find_or_insert_blob(tenant.id, ref_id).await?;

    let text = format.extract_text(&mut event.buffer)?;
    let metadata = format.extract_metadata(&mut event.buffer, &event.filename)?;
    if text.is_some() || !metadata.is_empty() {
        shared
            .index
            .upsert_blob_content(blob_id, text.as_deref(), &Value::Object(metadata))
            .await?;
    }

    Ok(blob_id)
}

/// Reports a finished leaf to whoever is waiting on it.
///
/// When this was the last outstanding child, the current worker becomes the
/// assembler and walks the chain upward for as long as each completed parent
/// turns out to be the last child of its own parent.
async fn conclude_leaf(
    shared: &Arc<PipelineShared>,
    event: &IngestEvent,
    blob_ref: BlobRef,
    blob_id: i64,
) -> Result<(), TaskError> {
    if let Some((ctx, slot, info)) = &event.fan_in {
        let result = ChildResult {
            info: info.clone(),
            blob_ref,
            blob_id,
        };
        if ctx.add_result(*slot, result) {
            let mut current = Some(ctx.clone());
            while let Some(c) = current {
                current = assemble(shared, &event.root, &c).await?;
            }
        }
    } else if !event.bonus {
        event.root.set_outcome(IngestReport { blob_ref, blob_id });
    }
    Ok(())
}

/// Creates the fan-in context for a container and dispatches its children.
async fn fan_out(
    shared: &Arc<PipelineShared>,
    event: IngestEvent,
    extraction: Extraction,
    format: &dyn Format,
    hash: ContentHash,
    size: u64,
    mime: Option<String>,
) -> Result<(), TaskError> {
    let IngestEvent {
        tenant,
        filename,
        fan_in,
        bonus,
        root,
        ..
    } = event;

    let children = extraction.children;
    let seed = AssemblySeed {
        tenant: tenant.clone(),
        original_hash: hash,
        original_size: size,
        format_id: format.id(),
        handler: format.name(),
        capability: extraction.capability,
        container_meta: extraction.container_meta,
        mime,
        is_root: fan_in.is_none() && !bonus,
    };
    let parent = fan_in.map(|(ctx, slot, info)| ParentLink { ctx, slot, info });

    let ctx = Arc::new(FanInContext {
        remaining: AtomicUsize::new(children.len()),
        slots: Mutex::new(children.iter().map(|_| None).collect()),
        parent,
        seed,
    });

    debug!(
        hash = %hash,
        children = children.len(),
        tier = ?ctx.seed.capability,
        "decomposing container"
    );

    if children.is_empty() {
        // Nothing to wait for; this worker is trivially the assembler.
        let mut current = Some(ctx);
        while let Some(c) = current {
            current = assemble(shared, &root, &c).await?;
        }
        return Ok(());
    }

    root.add(children.len());
    for (slot, child) in children.into_iter().enumerate() {
        let info = ChildInfo::of(&child);
        let child_event = IngestEvent {
            tenant: tenant.clone(),
            buffer: child.data,
            filename: child.path,
            fan_in: Some((ctx.clone(), slot, info)),
            bonus: false,
            root: root.clone(),
        };
        enqueue(shared, child_event);
    }

    Ok(())
}

/// Encodes, stores, and indexes a completed container, then signals its
/// parent. Returns the parent context when that signal completed the
/// parent's fan-in too.
async fn assemble(
    shared: &Arc<PipelineShared>,
    root: &Arc<RootContext>,
    ctx: &FanInContext,
) -> Result<Option<Arc<FanInContext>>, TaskError> {
    let results = ctx.take_results();
    let seed = &ctx.seed;

    let manifest = Manifest {
        format_id: seed.format_id,
        capability: seed.capability,
        entries: results
            .iter()
            .map(|result| ManifestEntry {
                path: result.info.path.clone(),
                entry_type: result.info.entry_type,
                is_container: result.blob_ref.is_container(),
                child_hash: result.blob_ref.hash,
                child_leaf_size: result.blob_ref.leaf_size,
                mtime_millis: result.info.mtime_millis,
                metadata: result.info.metadata.clone(),
            })
            .collect(),
        container_meta: seed.container_meta.clone(),
    };

    let container_ref = BlobRef::container(seed.original_hash, seed.original_size);
    let mut manifest_buffer = Buffer::from_bytes(manifest.encode());
    shared
        .storage
        .write(
            &seed.tenant.key(),
            &container_ref,
            &mut manifest_buffer,
            seed.mime.as_deref(),
        )
        .await?;

    let ref_id = shared
        .index
        .find_or_insert_blob_ref(&container_ref, seed.mime.as_deref(), Some(seed.handler))
        .await?;
    let blob_id = shared
        .index
        .find_or_insert_blob(seed.tenant.id, ref_id)
        .await?;

    let rows = results
        .iter()
        .enumerate()
        .map(|(position, result)| NewEntry {
            blob_id: result.blob_id,
            entry_type: result.info.entry_type,
            internal_path: result.info.path.clone(),
            mtime_millis: result.info.mtime_millis,
            metadata: entry_metadata_json(&result.info.metadata),
            position: position as i64,
        })
        .collect();
    shared.index.insert_container(blob_id, rows).await?;

    debug!(container = %container_ref, entries = manifest.entries.len(), "container assembled");

    if seed.is_root {
        root.set_outcome(IngestReport {
            blob_ref: container_ref,
            blob_id,
        });
    }

    if let Some(parent) = &ctx.parent {
        let result = ChildResult {
            info: parent.info.clone(),
            blob_ref: container_ref,
            blob_id,
        };
        if parent.ctx.add_result(parent.slot, result) {
            return Ok(Some(parent.ctx.clone()));
        }
    }

    Ok(None)
}

/// The index stores per-entry metadata as JSON; our formats serialize JSON
/// already, and anything else is preserved hex-encoded.
fn entry_metadata_json(metadata: &[u8]) -> Value {
    if metadata.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_slice(metadata)
        .unwrap_or_else(|_| serde_json::json!({ "raw_hex": hex::encode(metadata) }))
}

fn enqueue(shared: &Arc<PipelineShared>, event: IngestEvent) {
    // Never block a worker on the bounded queue: a full queue plus busy
    // workers would deadlock the fan-out.
    let sender = shared.events.clone();
    tokio::spawn(async move {
        if let Err(mpsc::error::SendError(event)) = sender.send(event).await {
            // Pipeline shut down mid-ingest; settle the waiter.
            event
                .root
                .fail(TaskError::terminal("ingest pipeline is shut down"));
            event.root.finish_one();
        }
    });
}
