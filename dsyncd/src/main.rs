use std::process::ExitCode;

use dsyncd::daemon::{DaemonConfig, DaemonRuntime, ExitReason};
use dsyncd::storage::TokenStorage;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Setup,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--setup" => mode = CliMode::Setup,
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(mode: CliMode) -> anyhow::Result<()> {
    match mode {
        CliMode::Logout => {
            TokenStorage::new()?.delete_token()?;
            info!("saved token removed");
            Ok(())
        }
        CliMode::Help => {
            println!("Usage: dsyncd [--setup | --logout]");
            println!("  --setup    Choose the local folder and authorize again, then run");
            println!("  --logout   Remove the saved access token and exit");
            Ok(())
        }
        CliMode::Run | CliMode::Setup => {
            let config = DaemonConfig::from_env()?.with_force_setup(mode == CliMode::Setup);
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let result = match parse_cli_mode(std::env::args()) {
        Ok(mode) => run(mode).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => ExitCode::from(ExitReason::Success.code()),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(ExitReason::from_error(&err).code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["dsyncd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_setup() {
        let mode = parse_cli_mode(vec!["dsyncd".to_string(), "--setup".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Setup);
    }

    #[test]
    fn parse_cli_mode_supports_logout() {
        let mode = parse_cli_mode(vec!["dsyncd".to_string(), "--logout".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Logout);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["dsyncd".to_string(), "-h".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["dsyncd".to_string(), "--bogus".to_string()]).is_err());
    }
}
