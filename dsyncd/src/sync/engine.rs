use std::sync::Arc;
use std::time::Duration;

use dsync_core::{DropboxClient, DropboxError, Metadata};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::events::{
    BatchOrigin, LocalChange, LocalEvent, RemoteBatch, RemoteChange, RemoteEvent, SyncEvent,
};
use super::index::{DeleteTarget, FileRecord, IndexError, MetadataStore, PendingDelete};
use super::local_fs::{LocalFolder, LocalFsError};
use super::paths::path_lower;
use super::queue::{Action, ActionKind, ActionQueue};
use super::settings::CursorStore;
use super::tracker::{DEFAULT_TRACKER_TTL, OperationTracker};
use super::transfer::{TransferClient, TransferError};

/// How often a store failure is retried from the triggering event before the engine gives up.
const STORE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("api error: {0}")]
    Api(#[from] DropboxError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("local file error: {0}")]
    Local(#[from] LocalFsError),
    #[error("metadata store failed {attempts} times: {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: IndexError,
    },
}

impl EngineError {
    /// Errors that stop the engine. Everything else is a per-path failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::StoreUnavailable { .. } => true,
            _ => self.api().is_some_and(DropboxError::is_auth),
        }
    }

    fn api(&self) -> Option<&DropboxError> {
        match self {
            EngineError::Api(err) => Some(err),
            EngineError::Transfer(err) => err.as_api(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub tracker_ttl: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tracker_ttl: DEFAULT_TRACKER_TTL,
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

/// Whether a finished action will be observed again as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Echo {
    Expected,
    None,
}

enum Trigger<'a> {
    Local(&'a LocalEvent),
    Remote(&'a RemoteBatch),
}

/// Single consumer of local and remote change events.
///
/// Each event is turned into metadata updates plus queued corrective actions,
/// which run before the next event is taken. Actions the engine performs are
/// recorded in the operation tracker first so that their echoes are dropped.
pub struct SyncEngine {
    client: DropboxClient,
    store: Arc<MetadataStore>,
    cursors: CursorStore,
    local: LocalFolder,
    transfer: TransferClient,
    tracker: OperationTracker,
    queue: ActionQueue,
    backoff: Backoff,
    max_attempts: u32,
}

impl SyncEngine {
    pub fn new(
        client: DropboxClient,
        store: Arc<MetadataStore>,
        cursors: CursorStore,
        local: LocalFolder,
        config: EngineConfig,
    ) -> Self {
        Self {
            transfer: TransferClient::new(client.clone()),
            client,
            store,
            cursors,
            local,
            tracker: OperationTracker::new(config.tracker_ttl),
            queue: ActionQueue::default(),
            backoff: config.backoff,
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Consumes events until the channel closes or `cancel` fires. Once
    /// cancelled, stops after the action in flight; unfinished downloads and
    /// deletes are picked up again by [`Self::resume_pending`].
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<SyncEvent>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        self.resume_pending().await?;
        self.drain_until(&cancel).await?;
        info!("sync engine started");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.apply_event(event).await?;
            self.drain_until(&cancel).await?;
        }

        if !self.queue.is_empty() {
            info!(left = self.queue.len(), "stopping with queued actions");
        }
        info!("sync engine stopped");
        Ok(())
    }

    /// Queues the deletes recorded but never confirmed, then content for every
    /// record whose download never completed.
    pub async fn resume_pending(&mut self) -> Result<usize, EngineError> {
        let deletes = self.store.list_pending_deletes().await?;
        for pending in &deletes {
            let kind = match pending.target {
                DeleteTarget::Local => ActionKind::LocalDelete,
                DeleteTarget::Remote => ActionKind::RemoteDelete,
            };
            self.queue
                .enqueue(Action::new(kind, &pending.path_display, &pending.path_lower));
        }

        let unloaded = self.store.list_not_loaded().await?;
        for record in &unloaded {
            let kind = if record.is_folder() {
                ActionKind::LocalFolder
            } else {
                ActionKind::Download
            };
            self.queue.enqueue(
                Action::new(kind, &record.path_display, &record.path_lower).with_id(&record.id),
            );
        }

        let total = deletes.len() + unloaded.len();
        if total > 0 {
            info!(deletes = deletes.len(), downloads = unloaded.len(), "resuming unfinished work");
        }
        Ok(total)
    }

    /// Applies the metadata side of an event and queues its actions without running them.
    pub async fn apply_event(&mut self, event: SyncEvent) -> Result<(), EngineError> {
        match event {
            SyncEvent::Local(event) => self.apply_with_retry(Trigger::Local(&event)).await,
            SyncEvent::Remote(batch) => {
                let result = self.apply_with_retry(Trigger::Remote(&batch)).await;
                let _ = batch.applied.send(result.is_ok());
                result
            }
        }
    }

    /// Runs queued actions in order until the queue is empty or `cancel` fires.
    async fn drain_until(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        while !cancel.is_cancelled() {
            let Ok(action) = self.queue.dequeue() else {
                break;
            };
            self.run_action(action).await?;
        }
        Ok(())
    }

    async fn apply_with_retry(&mut self, trigger: Trigger<'_>) -> Result<(), EngineError> {
        let mut attempt = 0u32;
        loop {
            let result = match &trigger {
                Trigger::Local(event) => self.apply_local(event).await,
                Trigger::Remote(batch) => self.apply_remote_batch(batch).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(source) => {
                    attempt += 1;
                    if attempt >= STORE_ATTEMPTS {
                        return Err(EngineError::StoreUnavailable {
                            attempts: attempt,
                            source,
                        });
                    }
                    warn!(error = %source, attempt, "metadata store failed; retrying event");
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                }
            }
        }
    }

    async fn apply_remote_batch(&mut self, batch: &RemoteBatch) -> Result<(), IndexError> {
        let mut upserts = Vec::new();
        for event in &batch.events {
            match event.kind {
                RemoteChange::Removed => {
                    self.flush_upserts(&mut upserts).await?;
                    self.apply_remote_removal(event).await?;
                }
                RemoteChange::Added | RemoteChange::Modified => {
                    if let Some(update) = self.plan_remote_update(event).await? {
                        upserts.push(update);
                    }
                }
            }
        }
        self.flush_upserts(&mut upserts).await?;

        self.cursors.write_cursor(&batch.cursor).await?;
        if batch.origin == (BatchOrigin::Listing { has_more: false }) {
            self.cursors.mark_initial_sync_done().await?;
            info!("initial sync recorded as done");
        }
        debug!(events = batch.events.len(), queued = self.queue.len(), "remote batch applied");
        Ok(())
    }

    /// Decides what a remote addition or modification means locally. Returns the
    /// record to store, paired with the loaded flag it must end up with.
    async fn plan_remote_update(
        &mut self,
        event: &RemoteEvent,
    ) -> Result<Option<(FileRecord, bool)>, IndexError> {
        let Some(record) = event.to_record(false) else {
            return Ok(None);
        };
        let echo_kinds: &[ActionKind] = if event.is_folder {
            &[ActionKind::RemoteFolder]
        } else {
            &[ActionKind::Upload]
        };
        if self.tracker.is_tracked_any(&event.path_lower, echo_kinds) {
            debug!(path = %event.path_display, "remote echo of our own change");
            return Ok(Some((record, true)));
        }

        let existing = self.store.read(&record.id).await?;
        let in_sync = existing.as_ref().is_some_and(|current| {
            current.loaded
                && current.path_lower == record.path_lower
                && (record.is_folder() || current.revision == record.revision)
        });
        if in_sync {
            return Ok(Some((record, true)));
        }

        let kind = if event.is_folder {
            ActionKind::LocalFolder
        } else {
            ActionKind::Download
        };
        self.queue.enqueue(
            Action::new(kind, &event.path_display, &event.path_lower).with_id(&record.id),
        );
        Ok(Some((record, false)))
    }

    async fn flush_upserts(&self, upserts: &mut Vec<(FileRecord, bool)>) -> Result<(), IndexError> {
        if upserts.is_empty() {
            return Ok(());
        }
        let records: Vec<FileRecord> = upserts.iter().map(|(record, _)| record.clone()).collect();
        self.store.batch_upsert(&records).await?;
        for (record, loaded) in upserts.drain(..) {
            self.store.mark_loaded(&record.id, loaded).await?;
        }
        Ok(())
    }

    async fn apply_remote_removal(&mut self, event: &RemoteEvent) -> Result<(), IndexError> {
        if self
            .tracker
            .is_tracked(&event.path_lower, ActionKind::RemoteDelete)
        {
            debug!(path = %event.path_display, "remote echo of our own delete");
            return Ok(());
        }
        // Deleted entries may only carry the lowercased path; the local name is the stored one.
        let local_path = match self.store.read_by_lower_path(&event.path_lower).await? {
            Some(record) => record.path_display,
            None => event.path_display.clone(),
        };
        let cancelled = self.queue.cancel_path(&event.path_lower);
        let removed = self
            .store
            .delete_subtree_pending(&PendingDelete {
                path_display: local_path.clone(),
                path_lower: event.path_lower.clone(),
                target: DeleteTarget::Local,
            })
            .await?;
        debug!(path = %local_path, cancelled, removed, "remote removal");
        self.queue.enqueue(Action::new(
            ActionKind::LocalDelete,
            local_path,
            &event.path_lower,
        ));
        Ok(())
    }

    async fn apply_local(&mut self, event: &LocalEvent) -> Result<(), IndexError> {
        let key = path_lower(&event.path);
        match event.kind {
            LocalChange::Created | LocalChange::Modified => {
                if self
                    .tracker
                    .is_tracked_any(&key, &[ActionKind::Download, ActionKind::LocalFolder])
                {
                    debug!(path = %event.path, "local echo of our own change");
                    if let Some(record) = self.store.read_by_lower_path(&key).await? {
                        self.store.mark_loaded(&record.id, true).await?;
                    }
                    return Ok(());
                }

                if event.is_dir {
                    if let Some(record) = self.store.read_by_lower_path(&key).await? {
                        if !record.loaded {
                            self.store.mark_loaded(&record.id, true).await?;
                        }
                        return Ok(());
                    }
                    self.queue
                        .enqueue(Action::new(ActionKind::RemoteFolder, &event.path, &key));
                    // A folder moved or renamed into place arrives as one event.
                    self.queue_folder_contents(&event.path).await?;
                } else {
                    self.queue
                        .enqueue(Action::new(ActionKind::Upload, &event.path, &key));
                }
            }
            LocalChange::Deleted => {
                if self.tracker.is_tracked(&key, ActionKind::LocalDelete) {
                    debug!(path = %event.path, "local echo of our own delete");
                    return Ok(());
                }
                self.queue.cancel_path(&key);
                if self.store.read_by_lower_path(&key).await?.is_none() {
                    debug!(path = %event.path, "deleted path was never synced");
                    return Ok(());
                }
                self.store
                    .delete_subtree_pending(&PendingDelete {
                        path_display: event.path.clone(),
                        path_lower: key.clone(),
                        target: DeleteTarget::Remote,
                    })
                    .await?;
                self.queue
                    .enqueue(Action::new(ActionKind::RemoteDelete, &event.path, &key));
            }
        }
        Ok(())
    }

    /// Queues the contents of a folder new to the index for upload, skipping
    /// files whose content is already known to be synced.
    async fn queue_folder_contents(&mut self, folder: &str) -> Result<(), IndexError> {
        let entries = match self.local.list_tree(folder).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %folder, error = %err, "could not list new folder");
                return Ok(());
            }
        };
        for (path, is_dir) in entries {
            let key = path_lower(&path);
            if self
                .store
                .read_by_lower_path(&key)
                .await?
                .is_some_and(|record| record.loaded)
            {
                continue;
            }
            let kind = if is_dir {
                ActionKind::RemoteFolder
            } else {
                ActionKind::Upload
            };
            self.queue.enqueue(Action::new(kind, &path, &key));
        }
        Ok(())
    }

    async fn run_action(&mut self, mut action: Action) -> Result<(), EngineError> {
        let mut store_failures = 0u32;
        loop {
            let token = self.tracker.begin(&action.path_lower, action.kind);
            let err = match self.execute(&action).await {
                Ok(Echo::Expected) => {
                    // The echo can only arrive once the side effect has landed.
                    self.tracker.refresh(token);
                    return Ok(());
                }
                Ok(Echo::None) => {
                    self.tracker.end(token);
                    return Ok(());
                }
                Err(err) => {
                    self.tracker.end(token);
                    err
                }
            };

            if err.is_fatal() {
                return Err(err);
            }
            if let EngineError::Index(source) = err {
                store_failures += 1;
                if store_failures >= STORE_ATTEMPTS {
                    return Err(EngineError::StoreUnavailable {
                        attempts: store_failures,
                        source,
                    });
                }
                warn!(path = %action.path_display, error = %source, "metadata store failed; retrying action");
                tokio::time::sleep(self.backoff.delay(store_failures)).await;
                continue;
            }

            let delay = err
                .api()
                .and_then(|api| self.backoff.retry_delay(api, action.attempt, self.max_attempts));
            match delay {
                Some(delay) => {
                    warn!(
                        path = %action.path_display,
                        kind = ?action.kind,
                        attempt = action.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "action failed; retrying"
                    );
                    action.attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(path = %action.path_display, kind = ?action.kind, error = %err, "action failed");
                    return Ok(());
                }
            }
        }
    }

    async fn execute(&mut self, action: &Action) -> Result<Echo, EngineError> {
        match action.kind {
            ActionKind::Download => {
                let written = self
                    .transfer
                    .download(&action.path_display, &self.local)
                    .await?;
                self.mark_action_loaded(action).await?;
                info!(path = %action.path_display, bytes = written, "downloaded");
                Ok(Echo::Expected)
            }
            ActionKind::LocalFolder => {
                let created = self.local.create_directory(&action.path_display).await?;
                self.mark_action_loaded(action).await?;
                Ok(if created { Echo::Expected } else { Echo::None })
            }
            ActionKind::LocalDelete => {
                let removed = self.local.delete_recursive(&action.path_display).await?;
                self.store
                    .finish_delete(&action.path_lower, DeleteTarget::Local)
                    .await?;
                if removed {
                    info!(path = %action.path_display, "deleted locally");
                    Ok(Echo::Expected)
                } else {
                    Ok(Echo::None)
                }
            }
            ActionKind::Upload => {
                let meta = self
                    .transfer
                    .upload(&action.path_display, &self.local)
                    .await?;
                info!(path = %action.path_display, bytes = meta.size, "uploaded");
                self.store_remote_metadata(&Metadata::File(meta)).await?;
                Ok(Echo::Expected)
            }
            ActionKind::RemoteFolder => match self.client.create_folder(&action.path_display).await {
                Ok(meta) => {
                    info!(path = %action.path_display, "created remote folder");
                    self.store_remote_metadata(&Metadata::Folder(meta)).await?;
                    Ok(Echo::Expected)
                }
                Err(err) if err.is_conflict() => {
                    debug!(path = %action.path_display, "remote folder already exists");
                    Ok(Echo::None)
                }
                Err(err) => Err(err.into()),
            },
            ActionKind::RemoteDelete => {
                let echo = match self.client.delete(&action.path_display).await {
                    Ok(_) => {
                        info!(path = %action.path_display, "deleted remotely");
                        Echo::Expected
                    }
                    Err(err) if err.is_not_found() => {
                        debug!(path = %action.path_display, "remote object already gone");
                        Echo::None
                    }
                    Err(err) => return Err(err.into()),
                };
                self.store
                    .finish_delete(&action.path_lower, DeleteTarget::Remote)
                    .await?;
                Ok(echo)
            }
        }
    }

    async fn mark_action_loaded(&self, action: &Action) -> Result<(), IndexError> {
        let id = match &action.id {
            Some(id) => Some(id.clone()),
            None => self
                .store
                .read_by_lower_path(&action.path_lower)
                .await?
                .map(|record| record.id),
        };
        if let Some(id) = id {
            self.store.mark_loaded(&id, true).await?;
        }
        Ok(())
    }

    async fn store_remote_metadata(&self, meta: &Metadata) -> Result<(), IndexError> {
        let Some(record) = RemoteEvent::from_metadata(meta, true).and_then(|event| event.to_record(true))
        else {
            return Ok(());
        };
        self.store.upsert(&record).await?;
        self.store.mark_loaded(&record.id, true).await
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
