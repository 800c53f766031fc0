use routesync::config::Config;
use routesync::db::Database;
use routesync::discovery::DiscoveryWatcher;
use routesync::docker::DockerSource;
use routesync::engine::Engine;
use routesync::error::{ErrorResponse, ReconcileError};
use routesync::gitops::{GitCli, GitCommitter, GitSyncer, SyncOutcome, VersionControl};
use routesync::live::{AdminApiClient, LiveConfig};
use routesync::model::SnapshotKind;
use routesync::secrets::CredentialVault;
use routesync::service::AdminService;
use routesync::snapshot::SnapshotManager;
use routesync::{PKG_NAME, VERSION};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const USAGE: &str = "usage: routesync [run|rebuild|restore|snapshot|sync <source>|status] [config]";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Run,
    Rebuild,
    Restore,
    Snapshot,
    Sync(String),
    Status,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<(Command, PathBuf)> {
    let command = match args.next().as_deref() {
        None | Some("run") => Command::Run,
        Some("rebuild") => Command::Rebuild,
        Some("restore") => Command::Restore,
        Some("snapshot") => Command::Snapshot,
        Some("status") => Command::Status,
        Some("sync") => match args.next() {
            Some(source) => Command::Sync(source),
            None => anyhow::bail!("sync requires a source name or id\n{}", USAGE),
        },
        Some(other) => anyhow::bail!("unknown command '{}'\n{}", other, USAGE),
    };

    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("routesync.toml"));
    Ok((command, config_path))
}

/// Shared components every command needs
struct Runtime {
    config: Config,
    live: Arc<dyn LiveConfig>,
    engine: Arc<Engine>,
    vault: Arc<CredentialVault>,
}

impl Runtime {
    fn build(config: Config) -> anyhow::Result<Self> {
        let db = Arc::new(Database::open(&config.store.database)?);
        let live: Arc<dyn LiveConfig> = Arc::new(AdminApiClient::new(&config.remote)?);
        let snapshots = Arc::new(SnapshotManager::new(&config.store.snapshot_dir, db.clone())?);
        let engine = Arc::new(Engine::new(db, live.clone(), snapshots, &config.remote));
        let vault = Arc::new(CredentialVault::load_or_create(&config.store.key_file)?);

        Ok(Self {
            config,
            live,
            engine,
            vault,
        })
    }

    fn vcs(&self) -> Arc<dyn VersionControl> {
        Arc::new(GitCli::new(&self.config.gitops))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("routesync=info".parse()?))
        .init();

    let (command, config_path) = parse_args(std::env::args().skip(1))?;

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    let runtime = Runtime::build(config)?;

    match command {
        Command::Run => run(runtime).await,
        Command::Rebuild => {
            let report = runtime.engine.rebuild_from_store().await.map_err(report_error)?;
            println!(
                "{}",
                json!({"applied": report.applied, "failed": report.failed, "foreign_routes": report.foreign_routes})
            );
            Ok(())
        }
        Command::Restore => {
            match runtime.engine.restore_latest().await.map_err(report_error)? {
                Some(path) => println!("restored {}", path.display()),
                None => println!("no snapshot to restore"),
            }
            Ok(())
        }
        Command::Snapshot => {
            let config = runtime.live.get_full_config().await.map_err(report_error)?;
            let record = runtime.engine.snapshots().snapshot(&config).await?;
            println!("{}", record.path);
            Ok(())
        }
        Command::Sync(key) => {
            let admin = AdminService::new(runtime.engine.clone(), runtime.vault.clone());
            let source = admin.find_git_source(&key).map_err(report_error)?;
            let syncer = GitSyncer::new(
                runtime.engine.clone(),
                runtime.vcs(),
                runtime.vault.clone(),
                &runtime.config.gitops,
            );
            match syncer.sync_once(&source.id).await? {
                SyncOutcome::Unchanged { revision } => println!("{} already at {}", source.name, revision),
                SyncOutcome::Applied { revision, diff } => println!(
                    "{} applied {}: {}",
                    source.name,
                    revision,
                    serde_json::to_string(&diff)?
                ),
            }
            Ok(())
        }
        Command::Status => status(&runtime).await,
    }
}

/// Print the admin-facing error body and hand the error back
fn report_error(err: ReconcileError) -> anyhow::Error {
    eprintln!("{}", ErrorResponse::from(&err).to_json());
    err.into()
}

async fn run(runtime: Runtime) -> anyhow::Result<()> {
    info!(name = PKG_NAME, version = VERSION, "Starting route reconciler");
    info!(
        admin_url = %runtime.config.remote.admin_url,
        server = %runtime.config.remote.server_name,
        discovery = runtime.config.discovery.enabled,
        "Remote server configuration"
    );

    let recovery = runtime.engine.recover_on_startup().await.map_err(report_error)?;
    if let Some(path) = &recovery.restored_snapshot {
        warn!(path = %path.display(), "Live config was restored from snapshot");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if runtime.config.discovery.enabled {
        let discovery = &runtime.config.discovery;
        match DockerSource::connect(discovery.docker_host.as_deref(), &discovery.label_prefix).await {
            Ok(source) => {
                let watcher = DiscoveryWatcher::new(runtime.engine.clone(), Arc::new(source), discovery.clone());
                let rx = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move { watcher.run(rx).await }));
            }
            Err(e) => error!(error = %e, "Discovery disabled: cannot reach Docker"),
        }
    }

    let syncer = Arc::new(GitSyncer::new(
        runtime.engine.clone(),
        runtime.vcs(),
        runtime.vault.clone(),
        &runtime.config.gitops,
    ));
    let rescan = Duration::from_secs(runtime.config.gitops.default_interval_secs);
    tasks.push(tokio::spawn(syncer.run(shutdown_rx.clone(), rescan)));

    let committer = GitCommitter::new(
        runtime.engine.db().clone(),
        runtime.vcs(),
        runtime.vault.clone(),
        &runtime.config.gitops,
    );
    let changes = runtime.engine.subscribe();
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { committer.run(changes, rx).await }));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // an apply already in flight runs to completion
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed");
            }
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn status(runtime: &Runtime) -> anyhow::Result<()> {
    let admin = AdminService::new(runtime.engine.clone(), runtime.vault.clone());

    let proxies: Vec<_> = admin
        .list_proxies()?
        .into_iter()
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "status": p.status.as_str(),
                "route_index": p.route_index,
                "last_error": p.last_error,
            })
        })
        .collect();

    let drift: Vec<_> = match runtime.engine.index_drift().await {
        Ok(drift) => drift
            .into_iter()
            .map(|d| json!({"proxy": d.proxy, "stored": d.stored, "live": d.live}))
            .collect(),
        Err(e) => {
            warn!(error = %e, "Cannot compare with live routes");
            Vec::new()
        }
    };

    let sources: Vec<_> = admin
        .list_git_sources()?
        .into_iter()
        .map(|s| {
            json!({
                "name": s.name,
                "auto_sync": s.auto_sync,
                "auto_commit": s.auto_commit,
                "last_applied_revision": s.last_applied_revision,
                "last_sync_at": s.last_sync_at,
                "last_error": s.last_error,
            })
        })
        .collect();

    let latest_snapshot = runtime
        .engine
        .snapshots()
        .list(SnapshotKind::Live, 1)?
        .into_iter()
        .next()
        .map(|s| s.created_at);

    let body = json!({
        "name": PKG_NAME,
        "version": VERSION,
        "proxies": proxies,
        "drift": drift,
        "git_sources": sources,
        "discovered_services": admin.list_discovered_services()?.len(),
        "latest_snapshot": latest_snapshot,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
