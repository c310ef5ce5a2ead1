use std::sync::Arc;
use std::time::Duration;

use dsync_core::{DropboxClient, DropboxError, ListFolderResult, Metadata};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::events::{BatchOrigin, RemoteBatch, RemoteEvent, SyncEvent};
use super::index::{IndexError, MetadataStore};
use super::settings::CursorStore;

pub const DEFAULT_LONGPOLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("api error: {0}")]
    Api(#[from] DropboxError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("the remote cursor was reset and a full listing is required")]
    CursorReset,
    #[error("sync engine stopped accepting events")]
    EngineGone,
}

impl PollerError {
    pub fn is_auth(&self) -> bool {
        matches!(self, PollerError::Api(err) if err.is_auth())
    }
}

/// Settings shared by the initial listing and the poller.
#[derive(Debug, Clone, Copy)]
pub struct FetchConfig {
    pub backoff: Backoff,
    pub max_attempts: u32,
    pub longpoll_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: 5,
            longpoll_timeout_secs: DEFAULT_LONGPOLL_TIMEOUT_SECS,
        }
    }
}

/// Long-polls for remote changes and feeds them to the engine one page at a time.
pub struct RemotePoller {
    client: DropboxClient,
    store: Arc<MetadataStore>,
    cursors: CursorStore,
    events: mpsc::Sender<SyncEvent>,
    config: FetchConfig,
}

impl RemotePoller {
    pub fn new(
        client: DropboxClient,
        store: Arc<MetadataStore>,
        cursors: CursorStore,
        events: mpsc::Sender<SyncEvent>,
        config: FetchConfig,
    ) -> Self {
        Self {
            client,
            store,
            cursors,
            events,
            config,
        }
    }

    /// Runs until cancelled. Returns an error for authentication failures, a reset
    /// cursor, or when the engine is gone; everything else is retried.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), PollerError> {
        let mut cursor = match self.cursors.read_cursor().await? {
            Some(cursor) => cursor,
            None => {
                let latest = self.client.get_latest_cursor("/", true).await?;
                self.cursors.write_cursor(&latest).await?;
                latest
            }
        };
        info!("remote poller started");

        let mut failures = 0u32;
        let mut wait = None;
        while !cancel.is_cancelled() {
            if let Some(delay) = wait.take() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.client.longpoll(&cursor, self.config.longpoll_timeout_secs) => polled,
            };
            let changed = match polled {
                Ok(result) => {
                    wait = result.backoff.map(Duration::from_secs);
                    result.changes
                }
                Err(err) => {
                    wait = Some(self.failure_delay(err, &mut failures)?);
                    continue;
                }
            };
            if !changed {
                failures = 0;
                continue;
            }

            match self.fetch_changes(&cursor, cancel).await {
                Ok(Some(next)) => {
                    failures = 0;
                    cursor = next;
                }
                Ok(None) => break,
                Err(PollerError::Api(err)) => {
                    wait = Some(self.failure_delay(err, &mut failures)?);
                }
                Err(err) => return Err(err),
            }
        }
        info!("remote poller stopped");
        Ok(())
    }

    /// Pages through every change after `cursor`. Returns the cursor of the last
    /// applied page, or `None` when cancelled.
    async fn fetch_changes(
        &self,
        cursor: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, PollerError> {
        let mut cursor = cursor.to_string();
        let mut rejected = 0u32;
        loop {
            let page = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                page = self.client.list_folder_continue(&cursor) => page,
            };
            let page = page.map_err(|err| {
                if is_reset(&err) {
                    PollerError::CursorReset
                } else {
                    PollerError::Api(err)
                }
            })?;
            let has_more = page.has_more;
            let next = page.cursor.clone();
            debug!(entries = page.entries.len(), has_more, "fetched remote changes");

            if send_batch(&self.events, &self.store, page, false).await? {
                rejected = 0;
                cursor = next;
                if !has_more {
                    return Ok(Some(cursor));
                }
            } else {
                let delay = self.config.backoff.delay(rejected);
                rejected = rejected.saturating_add(1);
                warn!(delay_ms = delay.as_millis() as u64, "remote batch was not applied; retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    fn failure_delay(&self, err: DropboxError, failures: &mut u32) -> Result<Duration, PollerError> {
        if err.is_auth() {
            return Err(PollerError::Api(err));
        }
        if is_reset(&err) {
            return Err(PollerError::CursorReset);
        }
        // The poller never gives up on a transient failure; the attempt count only shapes the delay.
        let attempt = (*failures).min(self.config.max_attempts.saturating_sub(1));
        *failures = failures.saturating_add(1);
        let delay = err
            .retry_after_secs()
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.backoff.delay(attempt));
        warn!(error = %err, delay_ms = delay.as_millis() as u64, "remote poll failed");
        Ok(delay)
    }
}

/// Normalizes a page and hands it to the engine, waiting until it is applied.
/// Returns whether the engine committed the page.
pub(crate) async fn send_batch(
    events: &mpsc::Sender<SyncEvent>,
    store: &MetadataStore,
    page: ListFolderResult,
    listing: bool,
) -> Result<bool, PollerError> {
    let origin = if listing {
        BatchOrigin::Listing {
            has_more: page.has_more,
        }
    } else {
        BatchOrigin::Delta
    };
    let batch_events = normalize_entries(store, &page.entries).await?;
    let (applied_tx, applied_rx) = oneshot::channel();
    events
        .send(SyncEvent::Remote(RemoteBatch {
            events: batch_events,
            cursor: page.cursor,
            origin,
            applied: applied_tx,
        }))
        .await
        .map_err(|_| PollerError::EngineGone)?;
    applied_rx.await.map_err(|_| PollerError::EngineGone)
}

pub(crate) async fn normalize_entries(
    store: &MetadataStore,
    entries: &[Metadata],
) -> Result<Vec<RemoteEvent>, IndexError> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let known = match entry {
            Metadata::File(file) => store.read(&file.id).await?.is_some(),
            Metadata::Folder(folder) => store.read(&folder.id).await?.is_some(),
            Metadata::Deleted(_) => true,
        };
        if let Some(event) = RemoteEvent::from_metadata(entry, known) {
            out.push(event);
        }
    }
    Ok(out)
}

pub(crate) fn is_reset(err: &DropboxError) -> bool {
    matches!(
        err,
        DropboxError::Api { status, body, .. }
            if *status == reqwest::StatusCode::CONFLICT && body.contains("reset")
    )
}
