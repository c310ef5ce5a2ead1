use std::sync::Arc;

use dsync_core::DropboxClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::SyncEvent;
use super::index::MetadataStore;
use super::poller::{FetchConfig, PollerError, is_reset, send_batch};
use super::settings::CursorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialSyncOutcome {
    AlreadyDone,
    Completed { pages: u32 },
    Cancelled,
}

/// One-time recursive listing of the whole account.
///
/// Each page goes to the engine as a listing batch; the engine stores the page
/// cursor and, after the last page, the completion flag. An interrupted listing
/// therefore resumes from the last applied page on the next start.
pub struct InitialSync {
    client: DropboxClient,
    store: Arc<MetadataStore>,
    cursors: CursorStore,
    events: mpsc::Sender<SyncEvent>,
    config: FetchConfig,
}

impl InitialSync {
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

    pub async fn run(&self, cancel: &CancellationToken) -> Result<InitialSyncOutcome, PollerError> {
        if self.cursors.is_initial_sync_done().await? {
            return Ok(InitialSyncOutcome::AlreadyDone);
        }

        let mut pages = 0u32;
        let mut attempt = 0u32;
        loop {
            let cursor = self.cursors.read_cursor().await?;
            if pages == 0 {
                match &cursor {
                    Some(_) => info!("resuming interrupted initial listing"),
                    None => info!("starting initial listing"),
                }
            }

            let request = async {
                match &cursor {
                    Some(cursor) => self.client.list_folder_continue(cursor).await,
                    None => self.client.list_folder("/", true).await,
                }
            };
            let page = tokio::select! {
                _ = cancel.cancelled() => return Ok(InitialSyncOutcome::Cancelled),
                page = request => page,
            };

            let page = match page {
                Ok(page) => page,
                Err(err) if cursor.is_some() && is_reset(&err) => {
                    warn!("stored listing cursor expired; restarting the listing");
                    self.cursors.reset().await?;
                    continue;
                }
                Err(err) => match self.config.backoff.retry_delay(&err, attempt, self.config.max_attempts) {
                    Some(delay) => {
                        warn!(error = %err, attempt, "initial listing failed; retrying");
                        attempt += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(InitialSyncOutcome::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    None => return Err(PollerError::Api(err)),
                },
            };

            let has_more = page.has_more;
            if send_batch(&self.events, &self.store, page, true).await? {
                attempt = 0;
                pages += 1;
                if !has_more {
                    info!(pages, "initial listing complete");
                    return Ok(InitialSyncOutcome::Completed { pages });
                }
            } else {
                // Same cursor next time round.
                let delay = self.config.backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(InitialSyncOutcome::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
