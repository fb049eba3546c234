//! Replication engine: push queue, pull checkpoints and the background loop.
//!
//! Local mutations are appended to a durable queue by
//! [`ReplicationEngine::enqueue_change`]. `process_queue` drains it in batches
//! per collection, uploading pending attachments first. `pull` fetches remote
//! changes at or after the collection checkpoint, resolves conflicts with the
//! configured [`ConflictPolicy`] and advances the checkpoint over the
//! contiguous prefix of changes that were applied.
//!
//! Manual calls always run. The background loop started by `start` runs only
//! while [`Leadership::is_leader`] holds. `pause`/`resume` gate queue
//! draining only; pulls keep working while paused.

use crate::attachments::{AttachmentStore, FileInput};
use crate::clock::SystemClock;
use crate::config::ReplicationOptions;
use crate::election::{AlwaysLeader, Leadership};
use crate::error::{Result, RuntimeError};
use crate::projection::ProjectionHub;
use crate::remote::{RemoteBackend, StorageStrategy};
use crate::store::Store;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use harbor_engine::{
    decide, AttachmentStatus, Clock, CollectionName, Conflict, ConflictPolicy, FileRef, Item,
    LastWriteWins, PendingAttachment, PullDecision, QueueAction, QueueEntry, RemoteChange,
    Schema, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// Status and reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    #[default]
    Stopped,
    Starting,
    Idle,
    Pulling,
    Pushing,
    Paused,
    Error,
}

/// Published on a watch channel after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationStatus {
    pub state: ReplicationState,
    pub last_error: Option<String>,
    /// Queue entries not yet accepted by the remote
    pub pending: usize,
    pub last_synced_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub collection: CollectionName,
    /// Remote items stored locally, inserted or overwriting
    pub applied: usize,
    /// Local items physically removed by remote removals
    pub removed: usize,
    /// Remote changes dropped because the local item won
    pub discarded: usize,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<String>,
    /// Checkpoint after the pull
    pub checkpoint: Option<Timestamp>,
}

impl PullReport {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: Applied) {
        match outcome {
            Applied::Stored => self.applied += 1,
            Applied::Overwritten(conflict) => {
                self.applied += 1;
                self.conflicts.push(conflict);
            }
            Applied::Discarded(conflict) => {
                self.discarded += 1;
                self.conflicts.push(conflict);
            }
            Applied::Removed => self.removed += 1,
            Applied::Skipped => {}
        }
    }

    fn changed_local_state(&self) -> bool {
        self.applied > 0 || self.removed > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pulls: Vec<PullReport>,
    pub push: PushReport,
}

enum Applied {
    Stored,
    Overwritten(Conflict),
    Discarded(Conflict),
    Removed,
    Skipped,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

type LiveFeed = BoxStream<'static, (CollectionName, RemoteChange)>;

// ============================================================================
// ReplicationEngine
// ============================================================================

pub struct ReplicationEngine {
    store: Arc<dyn Store>,
    schema: Arc<Schema>,
    remote: Arc<dyn RemoteBackend>,
    storage: Option<Arc<dyn StorageStrategy>>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    policy: Arc<dyn ConflictPolicy>,
    clock: Arc<dyn Clock>,
    leadership: Arc<dyn Leadership>,
    projections: Option<Arc<ProjectionHub>>,
    options: ReplicationOptions,
    status: watch::Sender<ReplicationStatus>,
    paused: AtomicBool,
    /// Serializes queue drains
    push_lock: Mutex<()>,
    /// Per-collection locks serializing pulls
    pull_locks: DashMap<CollectionName, Arc<Mutex<()>>>,
    worker: Mutex<Option<Worker>>,
}

impl ReplicationEngine {
    pub fn new(store: Arc<dyn Store>, schema: Arc<Schema>, remote: Arc<dyn RemoteBackend>) -> Self {
        let (status, _) = watch::channel(ReplicationStatus::default());
        Self {
            store,
            schema,
            remote,
            storage: None,
            attachments: None,
            policy: Arc::new(LastWriteWins::default()),
            clock: Arc::new(SystemClock),
            leadership: Arc::new(AlwaysLeader),
            projections: None,
            options: ReplicationOptions::default(),
            status,
            paused: AtomicBool::new(false),
            push_lock: Mutex::new(()),
            pull_locks: DashMap::new(),
            worker: Mutex::new(None),
        }
    }

    /// Upload and download attachments through `storage`, reading and
    /// writing local blobs in `attachments`.
    pub fn with_attachments(
        mut self,
        storage: Arc<dyn StorageStrategy>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        self.storage = Some(storage);
        self.attachments = Some(attachments);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Gate the background loop on an election.
    pub fn with_leadership(mut self, leadership: Arc<dyn Leadership>) -> Self {
        self.leadership = leadership;
        self
    }

    pub fn with_projections(mut self, projections: Arc<ProjectionHub>) -> Self {
        self.projections = Some(projections);
        self
    }

    pub fn with_options(mut self, options: ReplicationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn status(&self) -> ReplicationStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ReplicationStatus> {
        self.status.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open change feeds and start the periodic sync loop. Starting a
    /// running engine is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }
        self.set_state(ReplicationState::Starting);

        let mut feeds: Vec<LiveFeed> = Vec::new();
        let mut feed_failed = false;
        for collection in self.collection_names() {
            match self.remote.subscribe(&collection).await {
                Ok(Some(feed)) => {
                    let name = collection.clone();
                    feeds.push(feed.map(move |change| (name.clone(), change)).boxed());
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Change feed unavailable");
                    self.record_error(e.to_string());
                    feed_failed = true;
                }
            }
        }
        let feed: LiveFeed = if feeds.is_empty() {
            stream::pending().boxed()
        } else {
            stream::select_all(feeds).boxed()
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run(feed, shutdown_rx).await });
        *worker = Some(Worker { shutdown, handle });

        if !feed_failed {
            self.set_state(if self.is_paused() {
                ReplicationState::Paused
            } else {
                ReplicationState::Idle
            });
        }
        tracing::info!(
            interval_ms = self.options.sync_interval.as_millis() as u64,
            "Replication started"
        );
        Ok(())
    }

    /// Stop the background loop and wait for it to finish.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.handle.await {
                tracing::warn!(error = %e, "Replication task ended abnormally");
            }
        }
        self.set_state(ReplicationState::Stopped);
        tracing::info!("Replication stopped");
    }

    /// Stop draining the queue. Pulls still run.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.set_state(ReplicationState::Paused);
        tracing::info!("Replication paused");
    }

    /// Allow queue draining again and drain right away.
    pub async fn resume(&self) -> Result<PushReport> {
        self.paused.store(false, Ordering::SeqCst);
        self.set_state(ReplicationState::Idle);
        tracing::info!("Replication resumed");
        self.process_queue().await
    }

    async fn run(self: Arc<Self>, mut feed: LiveFeed, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.options.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if !self.leadership.is_leader() {
                        continue;
                    }
                    if let Err(e) = self.sync_all().await {
                        tracing::warn!(error = %e, "Background sync failed");
                        self.record_error(e.to_string());
                    }
                }
                next = feed.next() => match next {
                    Some((collection, change)) => {
                        if self.leadership.is_leader() {
                            self.apply_live(&collection, change).await;
                        }
                    }
                    None => {
                        tracing::warn!("Change feed closed");
                        feed = stream::pending().boxed();
                    }
                },
            }
        }
    }

    // ------------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------------

    /// Append a queue entry for a local mutation.
    pub async fn enqueue_change(&self, item: &Item, action: QueueAction) -> Result<QueueEntry> {
        let pending_attachments = match (action, self.schema.get_collection(&item.collection)) {
            (QueueAction::Create | QueueAction::Update, Some(schema)) => item
                .file_refs(schema)
                .into_iter()
                .filter(|(_, file_ref)| file_ref.needs_upload())
                .map(|(field, file_ref)| PendingAttachment {
                    field,
                    file_id: file_ref.file_id,
                })
                .collect(),
            _ => Vec::new(),
        };

        let entry = QueueEntry::new(
            uuid::Uuid::new_v4().to_string(),
            action,
            item.clone(),
            pending_attachments,
            self.clock.now(),
        );
        let entry = self.store.enqueue(entry).await?;
        self.refresh_pending().await;

        tracing::debug!(
            collection = %entry.collection,
            item = %entry.item_id,
            action = entry.action.as_str(),
            seq = entry.seq,
            "Change enqueued"
        );
        Ok(entry)
    }

    /// Push every due queue entry. Does nothing while paused.
    ///
    /// Entries are sent per collection in queue order, `push_batch_size` at
    /// a time. An entry is removed once the remote lists its item as
    /// succeeded; anything else marks it failed and keeps it for retry.
    pub async fn process_queue(&self) -> Result<PushReport> {
        let mut report = PushReport::default();
        if self.is_paused() {
            return Ok(report);
        }
        let _guard = self.push_lock.lock().await;

        let entries: Vec<QueueEntry> = self
            .store
            .queue_entries(None)
            .await?
            .into_iter()
            .filter(QueueEntry::is_due)
            .collect();
        if entries.is_empty() {
            return Ok(report);
        }
        self.set_state(ReplicationState::Pushing);

        let mut groups: Vec<(CollectionName, Vec<QueueEntry>)> = Vec::new();
        for entry in entries {
            match groups.iter_mut().find(|(c, _)| *c == entry.collection) {
                Some((_, group)) => group.push(entry),
                None => groups.push((entry.collection.clone(), vec![entry])),
            }
        }

        for (collection, group) in groups {
            for batch in group.chunks(self.options.push_batch_size.max(1)) {
                self.push_batch(&collection, batch.to_vec(), &mut report)
                    .await?;
            }
        }

        self.refresh_pending().await;
        self.finish(report.errors.first().cloned());
        tracing::info!(
            pushed = report.pushed,
            failed = report.failed,
            "Queue processed"
        );
        Ok(report)
    }

    async fn push_batch(
        &self,
        collection: &str,
        batch: Vec<QueueEntry>,
        report: &mut PushReport,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut ready = Vec::with_capacity(batch.len());

        for mut entry in batch {
            entry.mark_processing(now);
            self.store.update_queue_entry(&entry).await?;
            match self.upload_attachments(&mut entry).await {
                Ok(()) => ready.push(entry),
                Err(e) => {
                    tracing::warn!(item = %entry.item_id, error = %e, "Attachment upload failed");
                    report.errors.push(format!("{}: {e}", entry.item_id));
                    report.failed += 1;
                    entry.mark_failed(e.to_string(), now);
                    self.store.update_queue_entry(&entry).await?;
                }
            }
        }
        if ready.is_empty() {
            return Ok(());
        }

        match self.remote.push(collection, &ready).await {
            Ok(response) => {
                let succeeded: HashSet<&str> =
                    response.succeeded_ids.iter().map(String::as_str).collect();
                let reason = if response.errors.is_empty() {
                    "rejected by remote".to_string()
                } else {
                    response.errors.join("; ")
                };
                report.errors.extend(response.errors.iter().cloned());

                for mut entry in ready {
                    if succeeded.contains(entry.item_id.as_str()) {
                        self.store.remove_queue_entry(&entry.id).await?;
                        if entry.action == QueueAction::Delete {
                            self.delete_remote_files(&entry.snapshot).await;
                        }
                        report.pushed += 1;
                    } else {
                        entry.mark_failed(reason.clone(), now);
                        self.store.update_queue_entry(&entry).await?;
                        report.failed += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "Push failed");
                report.errors.push(e.to_string());
                for mut entry in ready {
                    entry.mark_failed(e.to_string(), now);
                    self.store.update_queue_entry(&entry).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Upload pending attachments of an entry. Progress is kept on the entry
    /// so a retry only uploads what is still missing.
    async fn upload_attachments(&self, entry: &mut QueueEntry) -> Result<()> {
        if entry.pending_attachments.is_empty() {
            return Ok(());
        }
        let (Some(storage), Some(attachments)) = (&self.storage, &self.attachments) else {
            return Ok(());
        };
        let schema = self.schema.collection(&entry.collection)?;

        while let Some(pending) = entry.pending_attachments.first().cloned() {
            let current = entry
                .snapshot
                .file_refs(schema)
                .into_iter()
                .find(|(field, file_ref)| *field == pending.field && file_ref.file_id == pending.file_id);
            let Some((field, mut file_ref)) = current else {
                entry.pending_attachments.remove(0);
                continue;
            };

            let bytes = match attachments.get_file_data(&pending.file_id).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    if self
                        .still_references(&entry.collection, &entry.item_id, &field, &pending.file_id)
                        .await?
                    {
                        return Err(e);
                    }
                    // The blob was released with a later write; nothing to upload
                    tracing::debug!(
                        item = %entry.item_id,
                        field = %field,
                        file = %pending.file_id,
                        "Attachment released before upload"
                    );
                    file_ref.file_id = String::new();
                    file_ref.status = AttachmentStatus::Failed;
                    file_ref.error = Some("released before upload".to_string());
                    entry.snapshot.set_file_ref(&field, &file_ref);
                    entry.pending_attachments.remove(0);
                    continue;
                }
            };
            let path = format!("{}/{}/{}", entry.collection, entry.item_id, pending.file_id);
            let remote_path = storage.upload(&path, bytes).await?;

            file_ref.remote_path = Some(remote_path);
            file_ref.status = AttachmentStatus::Synced;
            file_ref.error = None;
            entry.snapshot.set_file_ref(&field, &file_ref);
            self.record_file_ref(&entry.collection, &entry.item_id, &field, &file_ref)
                .await?;
            entry.pending_attachments.remove(0);

            tracing::debug!(item = %entry.item_id, field = %field, path = %path, "Attachment uploaded");
        }
        Ok(())
    }

    /// Whether the stored item still points `field` at `file_id`.
    async fn still_references(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        file_id: &str,
    ) -> Result<bool> {
        Ok(self
            .store
            .get(collection, id)
            .await?
            .and_then(|item| item.data.get(field).and_then(FileRef::from_value))
            .is_some_and(|current| current.file_id == file_id))
    }

    /// Write an attachment state change back to the local item, unless the
    /// field has moved on to another file in the meantime.
    async fn record_file_ref(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        file_ref: &FileRef,
    ) -> Result<()> {
        let Some(mut item) = self.store.get(collection, id).await? else {
            return Ok(());
        };
        let same_file = item
            .data
            .get(field)
            .and_then(FileRef::from_value)
            .is_some_and(|current| current.file_id == file_ref.file_id);
        if same_file {
            item.set_file_ref(field, file_ref);
            self.store.put(&item).await?;
        }
        Ok(())
    }

    async fn delete_remote_files(&self, snapshot: &Item) {
        let (Some(storage), Some(schema)) = (
            &self.storage,
            self.schema.get_collection(&snapshot.collection),
        ) else {
            return;
        };
        for (_, file_ref) in snapshot.file_refs(schema) {
            if let Some(path) = &file_ref.remote_path {
                if let Err(e) = storage.delete(path).await {
                    tracing::warn!(path = %path, error = %e, "Remote attachment delete failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------------

    /// Pull one collection.
    ///
    /// A remote failure is reported in the returned report and the status,
    /// not as an `Err`; the checkpoint stays where it was.
    pub async fn pull(&self, collection: &str) -> Result<PullReport> {
        self.schema.collection(collection)?;
        let lock = self.pull_lock(collection);
        let _guard = lock.lock().await;

        let mut report = PullReport::new(collection);
        self.set_state(ReplicationState::Pulling);
        let mut checkpoint = self.store.checkpoint(collection).await?;

        let response = match self.remote.pull(collection, &checkpoint).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "Pull failed");
                report.errors.push(e.to_string());
                report.checkpoint = checkpoint.last_pulled_at;
                self.finish(Some(e.to_string()));
                return Ok(report);
            }
        };
        report.errors.extend(response.errors);

        let mut changes: Vec<RemoteChange> = response
            .changes
            .into_iter()
            .filter(|change| checkpoint.admits(change.updated_at()))
            .collect();
        changes.sort_by_key(RemoteChange::updated_at);

        let mut outcomes = Vec::with_capacity(changes.len());
        for change in changes {
            let at = change.updated_at();
            let id = change.item_id().to_string();
            match self.apply_change(collection, change).await {
                Ok(outcome) => {
                    report.record(outcome);
                    outcomes.push((at, true));
                }
                Err(e) => {
                    tracing::warn!(collection = %collection, item = %id, error = %e, "Remote change not applied");
                    report.errors.push(format!("{id}: {e}"));
                    outcomes.push((at, false));
                }
            }
        }

        checkpoint.advance(&outcomes);
        self.store.set_checkpoint(&checkpoint).await?;
        report.checkpoint = checkpoint.last_pulled_at;

        if report.changed_local_state() {
            if let Some(projections) = &self.projections {
                projections.refresh(collection).await;
            }
        }
        self.finish(report.errors.first().cloned());

        tracing::info!(
            collection = %collection,
            applied = report.applied,
            removed = report.removed,
            discarded = report.discarded,
            errors = report.errors.len(),
            "Pull completed"
        );
        Ok(report)
    }

    /// Pull every collection of the schema, then drain the queue.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let mut pulls = Vec::new();
        for collection in self.collection_names() {
            pulls.push(self.pull(&collection).await?);
        }
        let push = self.process_queue().await?;

        let now = self.clock.now();
        self.status.send_modify(|status| status.last_synced_at = Some(now));
        Ok(SyncReport { pulls, push })
    }

    async fn apply_live(&self, collection: &str, change: RemoteChange) {
        let lock = self.pull_lock(collection);
        let _guard = lock.lock().await;

        let at = change.updated_at();
        let result = async {
            let mut checkpoint = self.store.checkpoint(collection).await?;
            if !checkpoint.admits(at) {
                return Ok(false);
            }
            let outcome = self.apply_change(collection, change).await?;
            checkpoint.advance(&[(at, true)]);
            self.store.set_checkpoint(&checkpoint).await?;
            Ok::<_, RuntimeError>(!matches!(outcome, Applied::Discarded(_) | Applied::Skipped))
        }
        .await;

        match result {
            Ok(true) => {
                if let Some(projections) = &self.projections {
                    projections.refresh(collection).await;
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "Live change not applied");
                self.record_error(e.to_string());
            }
        }
    }

    async fn apply_change(&self, collection: &str, change: RemoteChange) -> Result<Applied> {
        match change {
            RemoteChange::Upsert { item } => {
                let local = self.store.get(collection, &item.id).await?;
                if local.is_none() && self.delete_pending(collection, &item.id).await? {
                    // Removed locally, the removal has not reached the remote yet
                    return Ok(Applied::Skipped);
                }
                match decide(local.as_ref(), item, self.policy.as_ref()) {
                    PullDecision::Insert(item) => {
                        let item = self.download_attachments(item, None).await;
                        self.store.put(&item).await?;
                        Ok(Applied::Stored)
                    }
                    PullDecision::Overwrite { item, conflict } => {
                        let item = self.download_attachments(item, local.as_ref()).await;
                        self.store.put(&item).await?;
                        if let Some(local) = &local {
                            let kept = self.file_ids(&item);
                            self.release_files(local, &kept).await;
                        }
                        Ok(Applied::Overwritten(conflict))
                    }
                    PullDecision::Discard { conflict } => {
                        if self.options.repush_on_local_win {
                            if let Some(local) = &local {
                                self.enqueue_change(local, QueueAction::Update).await?;
                            }
                        }
                        Ok(Applied::Discarded(conflict))
                    }
                }
            }
            RemoteChange::Removed { id, .. } => match self.store.get(collection, &id).await? {
                Some(local) => {
                    self.store.delete(collection, &id).await?;
                    self.release_files(&local, &HashSet::new()).await;
                    Ok(Applied::Removed)
                }
                None => Ok(Applied::Skipped),
            },
        }
    }

    /// Fetch remote blobs referenced by a pulled item into the local
    /// attachment store. A failed download marks the reference failed; the
    /// item itself is still stored.
    async fn download_attachments(&self, mut item: Item, local: Option<&Item>) -> Item {
        let (Some(storage), Some(attachments), Some(schema)) = (
            &self.storage,
            &self.attachments,
            self.schema.get_collection(&item.collection),
        ) else {
            return item;
        };

        for (field, mut file_ref) in item.file_refs(schema) {
            let Some(path) = file_ref.remote_path.clone() else {
                continue;
            };

            let existing = local
                .and_then(|l| l.data.get(&field))
                .and_then(FileRef::from_value)
                .filter(|r| r.remote_path.as_deref() == Some(path.as_str()) && !r.file_id.is_empty());
            if let Some(existing) = existing {
                if attachments.has_file(&existing.file_id).await {
                    item.set_file_ref(&field, &existing);
                    continue;
                }
            }
            if !file_ref.file_id.is_empty() && attachments.has_file(&file_ref.file_id).await {
                continue;
            }

            let fetched = async {
                let bytes = storage.download(&path).await?;
                attachments
                    .add_file(FileInput::new(
                        file_ref.name.clone(),
                        file_ref.mime_type.clone(),
                        bytes,
                    ))
                    .await
            }
            .await;

            match fetched {
                Ok(stored) => {
                    file_ref.file_id = stored.file_id;
                    file_ref.size = stored.size;
                    file_ref.status = AttachmentStatus::Synced;
                    file_ref.error = None;
                }
                Err(e) => {
                    tracing::warn!(item = %item.id, field = %field, error = %e, "Attachment download failed");
                    file_ref.file_id = String::new();
                    file_ref.status = AttachmentStatus::Failed;
                    file_ref.error = Some(e.to_string());
                }
            }
            item.set_file_ref(&field, &file_ref);
        }
        item
    }

    async fn delete_pending(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self
            .store
            .queue_entries(Some(collection))
            .await?
            .iter()
            .any(|e| e.item_id == id && e.action == QueueAction::Delete && e.is_due()))
    }

    fn file_ids(&self, item: &Item) -> HashSet<String> {
        self.schema
            .get_collection(&item.collection)
            .map(|schema| {
                item.file_refs(schema)
                    .into_iter()
                    .map(|(_, r)| r.file_id)
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delete the local blobs of `item` except those in `keep`.
    async fn release_files(&self, item: &Item, keep: &HashSet<String>) {
        let Some(attachments) = &self.attachments else {
            return;
        };
        for file_id in self.file_ids(item) {
            if keep.contains(&file_id) {
                continue;
            }
            if let Err(e) = attachments.delete_file(&file_id).await {
                tracing::warn!(file = %file_id, error = %e, "Attachment release failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn collection_names(&self) -> Vec<CollectionName> {
        let mut names: Vec<CollectionName> = self.schema.collections.keys().cloned().collect();
        names.sort();
        names
    }

    fn pull_lock(&self, collection: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.pull_locks
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    async fn refresh_pending(&self) {
        match self.store.queue_entries(None).await {
            Ok(entries) => {
                let pending = entries.iter().filter(|e| e.is_due()).count();
                self.status.send_modify(|status| status.pending = pending);
            }
            Err(e) => tracing::warn!(error = %e, "Could not count queue entries"),
        }
    }

    fn set_state(&self, state: ReplicationState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn record_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.state = ReplicationState::Error;
            status.last_error = Some(error);
        });
    }

    /// Settle the state after a pass.
    fn finish(&self, error: Option<String>) {
        let paused = self.is_paused();
        self.status.send_modify(|status| {
            status.state = if error.is_some() {
                ReplicationState::Error
            } else if paused {
                ReplicationState::Paused
            } else {
                ReplicationState::Idle
            };
            if error.is_some() {
                status.last_error = error;
            }
        });
    }
}
