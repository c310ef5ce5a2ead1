use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dsync_core::{
    DEFAULT_API_URL, DEFAULT_CONTENT_URL, DEFAULT_NOTIFY_URL, DropboxClient, DropboxError,
    OAuthClient, OAuthError,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::oauth_flow::{OAuthFlow, OAuthFlowError};
use crate::setup::{SetupError, expand_with_home, prompt_local_root};
use crate::storage::{StorageError, TokenStorage};
use crate::sync::backoff::Backoff;
use crate::sync::engine::{EngineConfig, SyncEngine};
use crate::sync::events::SyncEvent;
use crate::sync::index::{IndexError, MetadataStore};
use crate::sync::initial_sync::{InitialSync, InitialSyncOutcome};
use crate::sync::local_fs::{LocalFolder, LocalFsError};
use crate::sync::local_watcher::start_notify_watcher;
use crate::sync::poller::{DEFAULT_LONGPOLL_TIMEOUT_SECS, FetchConfig, PollerError, RemotePoller};
use crate::sync::settings::{CursorStore, SettingsStore};
use crate::sync::tracker::DEFAULT_TRACKER_TTL;

const DEFAULT_QUEUE_CAPACITY: u64 = 1024;
const DEFAULT_DEBOUNCE_MS: u64 = 200;
const DEFAULT_MAX_ATTEMPTS: u64 = 5;
const DB_FILE_NAME: &str = "dsync.db";

/// Process exit status of the daemon binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Success = 0,
    Failure = 1,
    Io = 2,
    Auth = 3,
}

impl ExitReason {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Classifies by the outermost recognised error in the chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(api) = cause.downcast_ref::<DropboxError>() {
                return if api.is_auth() {
                    ExitReason::Auth
                } else {
                    ExitReason::Failure
                };
            }
            if cause.is::<AuthRequired>() || cause.is::<OAuthError>() || cause.is::<OAuthFlowError>() {
                return ExitReason::Auth;
            }
            if cause.is::<IndexError>()
                || cause.is::<LocalFsError>()
                || cause.is::<SetupError>()
                || cause.is::<notify::Error>()
                || cause.is::<std::io::Error>()
            {
                return ExitReason::Io;
            }
        }
        ExitReason::Failure
    }
}

#[derive(Debug, Error)]
#[error("no Dropbox access token available; set DSYNC_APP_KEY and DSYNC_APP_SECRET and run dsyncd --setup")]
pub struct AuthRequired;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub local_root: Option<PathBuf>,
    pub db_path: PathBuf,
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
    pub access_token: Option<String>,
    pub api_url: String,
    pub content_url: String,
    pub notify_url: String,
    pub tracker_ttl: Duration,
    pub longpoll_timeout_secs: u64,
    pub queue_capacity: usize,
    pub debounce: Duration,
    pub max_attempts: u32,
    /// Re-run the folder and authorization prompts even when both are configured.
    pub force_setup: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let local_root = read_string_env("DSYNC_LOCAL_DIR").map(|value| expand_with_home(&value, &home));
        let db_path = read_string_env("DSYNC_DB_PATH")
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| default_db_path(&home));

        Ok(Self {
            local_root,
            db_path,
            app_key: read_string_env("DSYNC_APP_KEY"),
            app_secret: read_string_env("DSYNC_APP_SECRET"),
            access_token: read_string_env("DSYNC_ACCESS_TOKEN"),
            api_url: read_string_env("DSYNC_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            content_url: read_string_env("DSYNC_CONTENT_URL")
                .unwrap_or_else(|| DEFAULT_CONTENT_URL.to_string()),
            notify_url: read_string_env("DSYNC_NOTIFY_URL")
                .unwrap_or_else(|| DEFAULT_NOTIFY_URL.to_string()),
            tracker_ttl: Duration::from_secs(read_u64_env(
                "DSYNC_TRACKER_TTL_SECS",
                DEFAULT_TRACKER_TTL.as_secs(),
            )),
            longpoll_timeout_secs: read_u64_env("DSYNC_LONGPOLL_SECS", DEFAULT_LONGPOLL_TIMEOUT_SECS)
                .clamp(30, 480),
            queue_capacity: read_u64_env("DSYNC_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY) as usize,
            debounce: Duration::from_millis(read_u64_env("DSYNC_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)),
            max_attempts: read_u64_env("DSYNC_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)
                .min(u64::from(u32::MAX)) as u32,
            force_setup: false,
        })
    }

    pub fn with_force_setup(mut self, force_setup: bool) -> Self {
        self.force_setup = force_setup;
        self
    }

    fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            backoff: Backoff::default(),
            max_attempts: self.max_attempts,
            longpoll_timeout_secs: self.longpoll_timeout_secs,
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tracker_ttl: self.tracker_ttl,
            max_attempts: self.max_attempts,
            backoff: Backoff::default(),
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: DropboxClient,
    store: Arc<MetadataStore>,
    cursors: CursorStore,
    local: LocalFolder,
}

impl DaemonRuntime {
    /// Opens the database, settles the local folder and the access token
    /// (prompting when either is missing) and checks the token against the account.
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = MetadataStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
        let settings = SettingsStore::from_pool(store.pool().clone());
        let cursors = CursorStore::new(settings.clone());
        let first_run = settings.is_first_run().await?;
        if first_run {
            info!("first run: local folder and authorization will be set up");
        }

        let root = resolve_local_root(&config, &settings, &store, &cursors).await?;
        let token = resolve_token(&config).await?;
        let client = build_client(&config, &token)?;
        log_account_summary(&client).await?;

        if first_run {
            settings.mark_first_run_complete().await?;
        }

        Ok(Self {
            config,
            client,
            store: Arc::new(store),
            cursors,
            local: LocalFolder::new(root),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            local_root = %self.local.root().display(),
            db = %self.config.db_path.display(),
            "dsyncd started"
        );

        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel::<SyncEvent>(self.config.queue_capacity.max(1));

        let (watcher, mut local_rx) = start_notify_watcher(
            self.local.root(),
            self.config.queue_capacity,
            self.config.debounce,
            cancel.clone(),
        )
        .context("failed to start local watcher")?;
        let local_tx = events_tx.clone();
        let local_handle = tokio::spawn(async move {
            while let Some(event) = local_rx.recv().await {
                if local_tx.send(SyncEvent::Local(event)).await.is_err() {
                    break;
                }
            }
        });

        let mut engine = SyncEngine::new(
            self.client.clone(),
            Arc::clone(&self.store),
            self.cursors.clone(),
            self.local.clone(),
            self.config.engine_config(),
        );
        let engine_cancel = cancel.clone();
        let mut engine_handle = tokio::spawn(async move { engine.run(events_rx, engine_cancel).await });

        let remote = RemoteSync {
            client: self.client.clone(),
            store: Arc::clone(&self.store),
            cursors: self.cursors.clone(),
            events: events_tx,
            config: self.config.fetch_config(),
        };
        let remote_cancel = cancel.clone();
        let mut remote_handle = tokio::spawn(async move { remote.run(&remote_cancel).await });

        let stopped = tokio::select! {
            res = wait_for_shutdown() => {
                res?;
                info!("shutdown requested");
                Stopped::Signal
            }
            res = &mut engine_handle => Stopped::Engine(joined(res)),
            res = &mut remote_handle => Stopped::Remote(joined(res)),
        };
        cancel.cancel();

        let result = match stopped {
            Stopped::Signal => {
                let remote = joined(remote_handle.await);
                joined(engine_handle.await).and(remote)
            }
            Stopped::Engine(engine) => {
                let remote = joined(remote_handle.await);
                engine.context("sync engine stopped").and(remote)
            }
            Stopped::Remote(remote) => {
                let engine = joined(engine_handle.await);
                remote.context("remote sync stopped").and(engine)
            }
        };
        local_handle.abort();
        drop(watcher);
        info!("dsyncd stopped");
        result
    }
}

enum Stopped {
    Signal,
    Engine(anyhow::Result<()>),
    Remote(anyhow::Result<()>),
}

/// Initial listing followed by long-polling, restarted from scratch when the
/// backend invalidates the cursor.
struct RemoteSync {
    client: DropboxClient,
    store: Arc<MetadataStore>,
    cursors: CursorStore,
    events: mpsc::Sender<SyncEvent>,
    config: FetchConfig,
}

impl RemoteSync {
    async fn run(&self, cancel: &CancellationToken) -> Result<(), PollerError> {
        let result = self.run_inner(cancel).await;
        match result {
            Err(PollerError::EngineGone) if cancel.is_cancelled() => Ok(()),
            other => other,
        }
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), PollerError> {
        loop {
            let initial = InitialSync::new(
                self.client.clone(),
                Arc::clone(&self.store),
                self.cursors.clone(),
                self.events.clone(),
                self.config,
            );
            if initial.run(cancel).await? == InitialSyncOutcome::Cancelled {
                return Ok(());
            }

            let poller = RemotePoller::new(
                self.client.clone(),
                Arc::clone(&self.store),
                self.cursors.clone(),
                self.events.clone(),
                self.config,
            );
            match poller.run(cancel).await {
                Err(PollerError::CursorReset) => {
                    warn!("remote cursor was reset; running a full listing again");
                    self.cursors.reset().await?;
                }
                other => return other,
            }
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
