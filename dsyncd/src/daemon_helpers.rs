async fn resolve_local_root(
    config: &DaemonConfig,
    settings: &SettingsStore,
    store: &MetadataStore,
    cursors: &CursorStore,
) -> anyhow::Result<PathBuf> {
    if config.force_setup {
        return setup_local_folder(settings, store, cursors).await;
    }

    let stored = settings.local_root().await?;
    if let Some(root) = &config.local_root {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("failed to create local folder at {}", root.display()))?;
        if stored.as_deref() != Some(root.as_path()) {
            // Metadata recorded for another folder says nothing about this one.
            reset_sync_state(store, cursors).await?;
            settings.set_local_root(root).await?;
        }
        return Ok(root.clone());
    }

    match stored {
        Some(root) if tokio::fs::metadata(&root).await.is_ok_and(|meta| meta.is_dir()) => Ok(root),
        Some(root) => {
            info!(path = %root.display(), "local folder does not exist");
            setup_local_folder(settings, store, cursors).await
        }
        None => setup_local_folder(settings, store, cursors).await,
    }
}

async fn setup_local_folder(
    settings: &SettingsStore,
    store: &MetadataStore,
    cursors: &CursorStore,
) -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("home directory is unavailable")?;
    let root = {
        let stdin = std::io::stdin();
        let mut input = stdin.lock();
        let mut output = std::io::stdout();
        prompt_local_root(&mut input, &mut output, &home).context("local folder setup failed")?
    };

    LocalFolder::new(&root)
        .clear_contents()
        .await
        .with_context(|| format!("failed to prepare local folder at {}", root.display()))?;
    reset_sync_state(store, cursors).await?;
    settings.set_local_root(&root).await?;
    info!(path = %root.display(), "local folder configured");
    Ok(root)
}

/// Forgets every record and the cursor so the next start lists the account again.
async fn reset_sync_state(store: &MetadataStore, cursors: &CursorStore) -> Result<(), IndexError> {
    store.clear().await?;
    cursors.reset().await
}

async fn resolve_token(config: &DaemonConfig) -> anyhow::Result<String> {
    if let Some(token) = &config.access_token {
        return Ok(token.clone());
    }

    let storage = TokenStorage::new().context("failed to initialize token storage")?;
    if !config.force_setup {
        match storage.get_token() {
            Ok(token) => return Ok(token),
            Err(StorageError::TokenNotFound) => {}
            Err(err) => return Err(err).context("failed to read saved token"),
        }
    }

    let token = authorize_interactively(config).await?;
    storage.save_token(&token).context("failed to save token")?;
    Ok(token)
}

async fn authorize_interactively(config: &DaemonConfig) -> anyhow::Result<String> {
    let (Some(app_key), Some(app_secret)) = (&config.app_key, &config.app_secret) else {
        return Err(AuthRequired.into());
    };
    let flow = OAuthFlow::new(OAuthClient::new(app_key, app_secret).context("invalid oauth config")?);
    let code = {
        let stdin = std::io::stdin();
        let mut input = stdin.lock();
        let mut output = std::io::stdout();
        flow.prompt_code(&mut input, &mut output)?
    };
    let token = flow.exchange(&code).await?;
    info!(account = token.account_id.as_deref().unwrap_or("unknown"), "authorized");
    Ok(token.access_token)
}

fn build_client(config: &DaemonConfig, token: &str) -> Result<DropboxClient, DropboxError> {
    DropboxClient::with_base_urls(&config.api_url, &config.content_url, &config.notify_url, token)
}

async fn log_account_summary(client: &DropboxClient) -> anyhow::Result<()> {
    let account = client
        .get_current_account()
        .await
        .context("failed to fetch account info")?;
    let usage = client
        .get_space_usage()
        .await
        .context("failed to fetch space usage")?;
    info!(
        name = %account.name.display_name,
        used = %format_bytes(usage.used),
        allocated = %format_bytes(usage.allocation.allocated()),
        "connected to Dropbox"
    );
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("failed waiting for shutdown signal")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")
    }
}

fn joined<E>(res: Result<Result<(), E>, JoinError>) -> anyhow::Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    res.context("task panicked")??;
    Ok(())
}

fn default_db_path(home: &Path) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| home.join(".local/share"))
        .join("dsync")
        .join(DB_FILE_NAME)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
