use anyhow::Context;
use fitrep_sync::config::SyncConfig;
use fitrep_sync::entities::EntityStorage;
use fitrep_sync::model::SyncStatus;
use fitrep_sync::remote::RemoteSyncClient;
use fitrep_sync::session::{SessionError, Workspace};
use fitrep_sync::storage::{StorageError, TokenStorage};
use fitrep_sync::store::LocalStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "fitrep_sync=info,fitrep_core=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Sync,
    Status,
    StoreToken,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Sync;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--logout" => mode = CliMode::Logout,
            "--store-token" => mode = CliMode::StoreToken,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Token from the environment first, then the keyring.
fn resolve_token(config: &SyncConfig) -> Option<String> {
    if config.token.is_some() {
        return config.token.clone();
    }
    let storage = match TokenStorage::new() {
        Ok(storage) => storage,
        Err(err) => {
            warn!(error = %err, "keyring unavailable");
            return None;
        }
    };
    match storage.get_token() {
        Ok(token) => Some(token),
        Err(StorageError::TokenNotFound) => None,
        Err(err) => {
            warn!(error = %err, "failed to read saved token");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let mode = parse_cli_mode(std::env::args())?;
    match mode {
        CliMode::Logout => {
            let storage = TokenStorage::new().context("failed to open keyring")?;
            storage.delete_token()?;
            info!("saved token removed");
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: fitrep-sync [--status | --store-token | --logout]");
            println!("  --status        Show local evaluation and sync state, then exit");
            println!("  --store-token   Save FITREP_GITHUB_TOKEN to the keyring and exit");
            println!("  --logout        Remove the saved repository token and exit");
            return Ok(());
        }
        CliMode::Sync | CliMode::Status | CliMode::StoreToken => {}
    }

    let config = SyncConfig::from_env().context("failed to read configuration")?;
    if mode == CliMode::StoreToken {
        let token = config
            .token
            .as_deref()
            .context("FITREP_GITHUB_TOKEN is not set")?;
        let storage = TokenStorage::new().context("failed to open keyring")?;
        storage.save_token(token)?;
        info!("repository token saved");
        return Ok(());
    }
    let identity = config
        .identity()
        .context("FITREP_USER_EMAIL is not set")?;
    let store = LocalStore::open_with_fallback(&config.data_dir, config.store_backend)
        .await
        .with_context(|| format!("failed to open local store in {:?}", config.data_dir))?;
    info!(backend = store.backend().as_str(), "local store ready");

    let remote = match RemoteSyncClient::from_config(&config.remote_config(resolve_token(&config))) {
        Ok(client) => {
            info!(mode = client.mode(), "remote configured");
            Some(client)
        }
        Err(err) => {
            warn!(error = %err, "working offline");
            None
        }
    };
    let online = !config.offline;
    let workspace = Workspace::new(
        EntityStorage::new(store),
        remote,
        online,
        config.sync_policy(),
    );

    let mut ctx = workspace.login(&identity).await?;
    if mode == CliMode::Status {
        let count = |status: SyncStatus| {
            ctx.evaluations()
                .iter()
                .filter(|e| e.sync_status == status)
                .count()
        };
        println!(
            "{} ({}): {} synced, {} pending, {} error",
            ctx.email(),
            if workspace.is_online() { "online" } else { "offline" },
            count(SyncStatus::Synced),
            count(SyncStatus::Pending),
            count(SyncStatus::Error),
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match workspace.sync_pending(&mut ctx, &cancel).await {
        Ok(report) => println!("{}", report.summary()),
        Err(SessionError::Offline) => {
            println!("offline, {} evaluations left pending", ctx.pending_count());
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_sync() {
        let mode = parse_cli_mode(vec!["fitrep-sync".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Sync);
    }

    #[test]
    fn parse_cli_mode_supports_status_and_logout() {
        let status = parse_cli_mode(vec!["fitrep-sync".to_string(), "--status".to_string()]).unwrap();
        assert_eq!(status, CliMode::Status);
        let logout = parse_cli_mode(vec!["fitrep-sync".to_string(), "--logout".to_string()]).unwrap();
        assert_eq!(logout, CliMode::Logout);
        let store =
            parse_cli_mode(vec!["fitrep-sync".to_string(), "--store-token".to_string()]).unwrap();
        assert_eq!(store, CliMode::StoreToken);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["fitrep-sync".to_string(), "--daemon".to_string()]).is_err());
    }
}
