use clap::Parser;
use novabackup_core::prelude::*;
use novabackup_core::adapters::SshSftpAdapter;
use russh::client::{self, Handle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct AcceptAllHostKeys;

impl client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // The NAS is on the customer's private network; the remote
        // base path and credentials are what actually gates access.
        Ok(true)
    }
}

async fn connect_sftp(config: &BackupConfiguration) -> anyhow::Result<Arc<dyn SftpAdapter>> {
    let ssh_config = Arc::new(client::Config::default());
    let mut session: Handle<AcceptAllHostKeys> =
        client::connect(ssh_config, (config.host.as_str(), config.port), AcceptAllHostKeys).await?;

    let authenticated = if let Some(key_path) = &config.private_key_path {
        let key = russh::keys::load_secret_key(key_path, config.private_key_passphrase.as_deref())?;
        session
            .authenticate_publickey(
                &config.username,
                russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await?
            .success()
    } else if let Some(password) = &config.password {
        session
            .authenticate_password(&config.username, password)
            .await?
            .success()
    } else {
        false
    };

    if !authenticated {
        anyhow::bail!("sftp authentication failed for {}@{}", config.username, config.host);
    }

    let channel = session.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    let sftp = russh_sftp::client::SftpSession::new(channel.into_stream()).await?;
    Ok(Arc::new(SshSftpAdapter::new(sftp)))
}

#[derive(Parser)]
#[command(name = "novabackup-agent")]
#[command(version, about = "Unattended NovaBackup agent", long_about = None)]
struct Cli {
    /// Path to the local backup-config.json
    #[arg(long, default_value = "/etc/novabackup/backup-config.json")]
    config: PathBuf,

    /// Skip the initial NAS reachability check
    #[arg(long)]
    no_offline_start: bool,

    /// Run a single file backup and exit, instead of starting the scheduler loop
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "novabackup_agent=info,novabackup_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match BackupConfiguration::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %cli.config.display(), "failed to load configuration");
            std::process::exit(1);
        }
    };

    let adapter = match connect_sftp(&config).await {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, host = %config.host, "failed to establish sftp session");
            std::process::exit(1);
        }
    };
    let transport = Arc::new(SftpTransport::new(
        adapter,
        config.chunk_bytes,
        config.compress_before_upload,
        config.encryption_passphrase.clone(),
    ));
    transport.connect();

    if !cli.no_offline_start {
        if let Err(e) = probe_remote(&transport, &config).await {
            tracing::error!(error = %e, "initial NAS reachability check failed");
            std::process::exit(1);
        }
    }

    let current_index_path = cli
        .config
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("current-index.json");
    let customer_base_path = format!("{}/{}", config.remote_base_path, config.customer_id);

    let config_lock = Arc::new(RwLock::new(config));
    let process: Arc<dyn ProcessAdapter> = Arc::new(ShellProcessAdapter::new("true", vec![]));
    let executor = Arc::new(BackupExecutor::new(
        transport.clone(),
        ExecutorPaths {
            current_index_path,
            customer_base_path,
        },
        config_lock.clone(),
        process,
    ));

    if cli.once {
        let result = executor.run_file_backup().await;
        tracing::info!(run_id = %result.run_id, outcome = ?result.outcome, "one-shot backup finished");
        return Ok(());
    }

    let scheduler = Scheduler::new(config_lock, executor, Arc::new(SftpConfigResync::new(transport)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::select! {
        _ = scheduler.run(shutdown_rx) => {}
        _ = ctrl_c => {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}

async fn probe_remote(
    transport: &SftpTransport,
    config: &BackupConfiguration,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let runs_path = format!("{}/{}/runs", config.remote_base_path, config.customer_id);
    transport
        .list_run_dirs(&runs_path)
        .await
        .map(|_| ())
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
}
