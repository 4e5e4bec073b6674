//! `serve`, `reload` and `validate` subcommands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gateway::reload::ReloadCoordinator;
use gateway::router::create_router;
use notifier::NotifierRole;
use shared::error::CommonError;
use store::ConfigStoreLike;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::settings::Settings;

/// Operational exit codes: 1 for configuration load failures, 2 for reload
/// delivery failures.
pub const EXIT_CONFIG_ERROR: i32 = 1;
pub const EXIT_RELOAD_ERROR: i32 = 2;

pub struct CliError {
    pub code: i32,
    pub error: CommonError,
}

impl CliError {
    fn config(error: CommonError) -> Self {
        Self {
            code: EXIT_CONFIG_ERROR,
            error,
        }
    }

    fn reload(error: CommonError) -> Self {
        Self {
            code: EXIT_RELOAD_ERROR,
            error,
        }
    }
}

async fn load_settings(path: Option<&Path>) -> Result<Settings, CliError> {
    match path {
        Some(path) => Settings::load(path).await.map_err(CliError::config),
        None => Ok(Settings::default()),
    }
}

/// Seeds config documents from a directory into the store. Existing
/// documents are updated; the store's hash dedup keeps reruns quiet.
async fn seed_store(
    store: &dyn ConfigStoreLike,
    dir: &Path,
) -> Result<usize, CommonError> {
    let configs = config::loader::load_config_dir(dir).await?;
    let count = configs.len();
    for cfg in configs {
        match store.create(&cfg).await {
            Ok(()) => {}
            Err(CommonError::Duplicate { .. }) => store.update(&cfg).await?,
            Err(e) => return Err(e),
        }
    }
    Ok(count)
}

pub async fn cmd_serve(settings_path: Option<PathBuf>) -> Result<(), CliError> {
    let settings = load_settings(settings_path.as_deref()).await?;

    if let Some(pid_file) = &settings.pid_file {
        tokio::fs::write(pid_file, format!("{}\n", std::process::id()))
            .await
            .map_err(|e| CliError::config(e.into()))?;
        info!(pid_file = %pid_file.display(), "pid file written");
    }

    let store = settings.build_store().await.map_err(CliError::config)?;

    if let Some(config_dir) = &settings.config_dir {
        let seeded = seed_store(store.as_ref(), config_dir)
            .await
            .map_err(CliError::config)?;
        info!(count = seeded, dir = %config_dir.display(), "config documents seeded");
    }

    let options = settings.gateway_options();
    let (service, state, capabilities) = gateway::build_service(&options);

    let coordinator = Arc::new(ReloadCoordinator::new(
        store,
        state,
        service.sessions.clone(),
        options.call_timeout,
        options.build_timeout,
    ));
    coordinator
        .reload()
        .await
        .map_err(CliError::config)?;

    let shutdown = CancellationToken::new();
    let _sweeper = capabilities.spawn_sweeper(std::time::Duration::from_secs(60), shutdown.clone());

    let role: NotifierRole = settings.notifier.role.into();
    if role.can_receive() {
        let notifier = settings.build_notifier(role).map_err(CliError::config)?;
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            coordinator.run(notifier, shutdown).await;
        });
    } else {
        warn!("notifier role is sender-only, hot reload disabled for this replica");
    }

    let listener = tokio::net::TcpListener::bind(&settings.listen)
        .await
        .map_err(|e| CliError::config(e.into()))?;
    info!(listen = %settings.listen, "gateway listening");

    let app = create_router(service);
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let result = server.await;

    if let Some(pid_file) = &settings.pid_file {
        let _ = tokio::fs::remove_file(pid_file).await;
    }

    result.map_err(|e| CliError::config(e.into()))?;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => info!("interrupt received, shutting down"),
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
    }
}

pub async fn cmd_reload(
    settings_path: Option<PathBuf>,
    update: Option<PathBuf>,
) -> Result<(), CliError> {
    let settings = load_settings(settings_path.as_deref()).await?;

    let payload = match update {
        Some(path) => Some(
            config::loader::load_config_file(&path)
                .await
                .map_err(CliError::config)?,
        ),
        None => None,
    };

    let notifier = settings
        .build_notifier(NotifierRole::Sender)
        .map_err(CliError::config)?;
    notifier
        .notify_update(payload.as_ref())
        .await
        .map_err(CliError::reload)?;
    info!(carries_config = payload.is_some(), "reload notification sent");
    Ok(())
}

pub async fn cmd_validate(paths: Vec<PathBuf>) -> Result<(), CliError> {
    let mut configs = Vec::with_capacity(paths.len());
    for path in &paths {
        let cfg = config::loader::load_config_file(path)
            .await
            .map_err(CliError::config)?;
        configs.push(cfg);
    }

    let effective = config::merge_configs(&configs);
    gateway::state::build_state(&effective, None, std::time::Duration::from_secs(30))
        .map_err(CliError::config)?;

    info!(documents = paths.len(), "configuration is valid");
    Ok(())
}

pub fn report_and_exit(result: Result<(), CliError>) -> ! {
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e.error, "command failed");
            std::process::exit(e.code)
        }
    }
}
