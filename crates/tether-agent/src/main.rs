use std::{net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context;
use sea_orm_migration::MigratorTrait;
use tether_agent::{
    artifact::ArtifactLease,
    bridge_service::{self, BridgeRegistry},
    config::SupervisorConfig,
    engine_manager::EngineManager,
    installer::{DirectoryInstaller, SharedProfileLock},
    job_error::{self, ErrorCode},
    reattach::{DatabaseReattachPersistor, JsonFileReattachPersistor, ReattachPersistor},
    session_controller::{SessionController, SessionNotification},
    session_factory::{Session, SessionFactory},
    topic_client::TcpTopicClient,
};
use tether_interop::CompiledArtifact;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env();
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tether-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn open_persistor(config: &SupervisorConfig) -> anyhow::Result<Arc<dyn ReattachPersistor>> {
    match &config.database_url {
        Some(url) => {
            let db = tether_db::connect(url).await.context("connect to database")?;
            tether_migration::Migrator::up(&db, None)
                .await
                .context("run database migrations")?;
            tracing::info!("reattach records stored in the database");
            Ok(Arc::new(DatabaseReattachPersistor::new(
                db,
                config.instance_name.clone(),
            )))
        }
        None => Ok(Arc::new(JsonFileReattachPersistor::new(config.reattach_file()))),
    }
}

fn report(err: &anyhow::Error, what: &str) {
    match job_error::find(err) {
        Some(job) => tracing::error!(payload = %job.encode(), "{what} failed"),
        None => tracing::error!(error = %format!("{err:#}"), "{what} failed"),
    }
}

/// The configured build, run with the configured (or active) engine version.
async fn configured_artifact(
    config: &SupervisorConfig,
    engines: &EngineManager,
) -> anyhow::Result<Option<CompiledArtifact>> {
    let Some(path) = &config.artifact_path else {
        return Ok(None);
    };
    let engine_version = match &config.engine_version {
        Some(v) => v.clone(),
        None => engines.active_version().await.ok_or_else(|| {
            job_error::anyhow(
                ErrorCode::NoActiveEngine,
                "no engine version configured or active",
                Some("set TETHER_ENGINE_VERSION"),
            )
        })?,
    };
    let directory = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.data_root.clone());
    let artifact_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("TETHER_ARTIFACT_PATH has no file name")?;
    Ok(Some(CompiledArtifact {
        compile_job_id: 0,
        directory,
        artifact_name,
        engine_version,
    }))
}

async fn relay_notifications(mut rx: mpsc::UnboundedReceiver<SessionNotification>) {
    while let Some(notification) = rx.recv().await {
        match notification {
            SessionNotification::ChatSend(message) => {
                tracing::info!(channels = ?message.channel_ids, "engine chat: {}", message.text);
            }
            SessionNotification::Prime => tracing::info!("engine primed for next round"),
            SessionNotification::Event(event) => {
                tracing::info!(event = %event.event_name, parameters = ?event.parameters, "engine event");
            }
            SessionNotification::CustomCommandsChanged(commands) => {
                tracing::info!(count = commands.len(), "engine chat commands updated");
            }
        }
    }
}

async fn start_session(
    config: &SupervisorConfig,
    engines: &EngineManager,
    factory: &SessionFactory,
    persistor: &dyn ReattachPersistor,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<Session>> {
    match persistor.load().await {
        Ok(Some(info)) => {
            let pid = info.process_id;
            match factory.reattach(info, cancel).await {
                Ok(session) => return Ok(Some(session)),
                Err(e) => {
                    report(&e, "reattach");
                    tracing::warn!(pid, "previous engine process lost");
                }
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %format!("{e:#}"), "unreadable reattach record, ignoring"),
    }

    let Some(artifact) = configured_artifact(config, engines).await? else {
        tracing::info!("no artifact configured, waiting without a session");
        return Ok(None);
    };
    let (session, notifications) = factory
        .launch(ArtifactLease::new(artifact), false, cancel)
        .await?;
    let watcher = session.clone();
    tokio::spawn(async move {
        let result = watcher.launch_result().await;
        match result.startup_time {
            Some(t) => tracing::info!(startup_ms = t.as_millis() as u64, "engine online"),
            None if result.exited => {
                tracing::error!(code = ?result.exit_code, "engine exited during startup")
            }
            None => tracing::warn!("engine has not completed startup"),
        }
    });
    Ok(Some((session, notifications)))
}

async fn wait_for_exit(session: Option<&SessionController>) -> Option<i32> {
    match session {
        Some(s) => s.lifetime().await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(SupervisorConfig::from_env()?);
    let _log_guard = init_tracing(config.log_dir.as_deref());
    tokio::fs::create_dir_all(&config.data_root)
        .await
        .with_context(|| format!("create {}", config.data_root.display()))?;

    let shutdown = CancellationToken::new();
    let persistor = open_persistor(&config).await?;

    let engines = EngineManager::new(
        config.installation_root(),
        Arc::new(DirectoryInstaller::new(
            config.engine_source_root.clone(),
            config.profile_dir.clone(),
        )),
        SharedProfileLock::new(),
        config.auto_install,
    );
    let recovered = engines.recover().await.context("recover engine installations")?;
    tracing::info!(count = recovered.len(), "engine installations recovered");
    if let Some(version) = &config.engine_version
        && engines.active_version().await.as_ref() != Some(version)
    {
        if let Err(e) = engines.change_version(version, None, true, &shutdown).await {
            report(&e, "engine activation");
        }
    }

    let registry = BridgeRegistry::new();
    let addr: SocketAddr = ([127, 0, 0, 1], config.bridge_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind bridge on {addr}"))?;
    tracing::info!(%addr, "bridge listening");
    let server = {
        let router = bridge_service::router(registry.clone());
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
        })
    };

    let factory = SessionFactory::new(
        config.clone(),
        engines.clone(),
        registry,
        persistor.clone(),
        Arc::new(TcpTopicClient::localhost(config.topic_priority_attempts)),
    );
    let session = match start_session(&config, &engines, &factory, persistor.as_ref(), &shutdown).await {
        Ok(Some((session, notifications))) => {
            tokio::spawn(relay_notifications(notifications));
            Some(session)
        }
        Ok(None) => None,
        Err(e) => {
            report(&e, "session launch");
            None
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            tracing::info!("shutting down");
            if let Some(session) = &session
                && let Err(e) = session.release().await
            {
                tracing::error!(error = %format!("{e:#}"), "failed to persist session for reattach");
            }
        }
        code = wait_for_exit(session.as_ref()) => {
            tracing::info!(?code, "engine process ended, shutting down");
            if let Some(session) = &session {
                session.dispose().await;
            }
        }
    }

    shutdown.cancel();
    server.await.context("bridge task panicked")??;
    Ok(())
}
