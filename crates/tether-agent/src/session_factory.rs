use std::sync::Arc;

use anyhow::Context;
use rand::{Rng, distributions::Alphanumeric};
use tether_interop::{INTEROP_VERSION, ReattachInformation, RebootState, TopicParameters};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    artifact::ArtifactLease,
    bridge_service::BridgeRegistry,
    config::SupervisorConfig,
    engine_manager::{Cancelled, EngineManager},
    engine_process::EngineProcess,
    job_error::{self, ErrorCode},
    launch::{self, LaunchArguments, LaunchSpec},
    port_alloc::allocate_tcp_port,
    reattach::ReattachPersistor,
    session_controller::{
        LifecycleState, SendOptions, SessionController, SessionError, SessionNotification,
        SessionParts, SessionSettings,
    },
    topic_client::TopicTransport,
};

const ACCESS_IDENTIFIER_LEN: usize = 32;

pub type Session = (SessionController, mpsc::UnboundedReceiver<SessionNotification>);

fn random_access_identifier() -> String {
    rand::rngs::OsRng
        .sample_iter(&Alphanumeric)
        .take(ACCESS_IDENTIFIER_LEN)
        .map(char::from)
        .collect()
}

/// Starts engine processes (or adopts ones a previous supervisor left running) and
/// wraps them in sessions.
#[derive(Clone)]
pub struct SessionFactory {
    config: Arc<SupervisorConfig>,
    engines: EngineManager,
    registry: BridgeRegistry,
    persistor: Arc<dyn ReattachPersistor>,
    transport: Arc<dyn TopicTransport>,
}

impl SessionFactory {
    pub fn new(
        config: Arc<SupervisorConfig>,
        engines: EngineManager,
        registry: BridgeRegistry,
        persistor: Arc<dyn ReattachPersistor>,
        transport: Arc<dyn TopicTransport>,
    ) -> Self {
        Self {
            config,
            engines,
            registry,
            persistor,
            transport,
        }
    }

    fn settings(&self, validate_only: bool) -> SessionSettings {
        SessionSettings {
            instance_name: self.config.instance_name.clone(),
            startup_timeout: self.config.startup_timeout,
            validation_grace: self.config.validation_grace,
            reboot_gate_timeout: self.config.reboot_gate_timeout,
            validate_only,
        }
    }

    /// Launches the deployed build in `artifact` with the engine version it was
    /// compiled for.
    pub async fn launch(
        &self,
        artifact: ArtifactLease,
        validate_only: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Session> {
        let compiled = artifact.artifact().clone();
        let engine = self
            .engines
            .use_executables(
                Some(&compiled.engine_version),
                Some(&compiled.directory),
                cancel,
            )
            .await?;
        let installation = engine.installation();
        let caps = installation.capabilities();

        let access_identifier = random_access_identifier();
        let port = allocate_tcp_port(self.config.server_port, &[self.config.bridge_port])
            .context("allocate server port")?;
        let topic_port = if caps.separate_topic_port {
            Some(
                allocate_tcp_port(0, &[self.config.bridge_port, port])
                    .context("allocate topic port")?,
            )
        } else {
            None
        };

        let log_file = if self.config.engine_log_file {
            let dir = self.config.diagnostics_dir();
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
            Some(launch::diagnostics_log_path(&dir, &self.config.instance_name))
        } else {
            None
        };

        let params = launch::build_params(
            &launch::standard_params(&access_identifier, self.config.bridge_port),
            self.config.additional_params.as_deref(),
        );
        let args = LaunchArguments {
            artifact_path: compiled.artifact_path(),
            port,
            topic_port,
            security_level: self.config.security_level,
            visibility: self.config.visibility,
            allow_webclient: self.config.allow_webclient,
            log_file,
            params,
        };
        let spec = LaunchSpec {
            exec: installation.server_exe(),
            args: installation.format_arguments(&args),
        };

        tracing::info!(
            engine = %compiled.engine_version,
            port,
            ?topic_port,
            compile_job_id = compiled.compile_job_id,
            validate_only,
            "launching engine"
        );
        let process = EngineProcess::spawn(&spec, &compiled.directory, caps.stdout_capture)
            .map_err(|e| {
                job_error::anyhow(
                    ErrorCode::SessionLaunchFailed,
                    format!("could not start {}: {e:#}", spec.exec.display()),
                    None,
                )
            })?;

        let info = ReattachInformation {
            access_identifier,
            process_id: process.id(),
            port,
            topic_port,
            reboot_state: RebootState::Normal,
            artifact: compiled,
            topic_request_timeout_ms: self.config.topic_request_timeout.as_millis() as u64,
            interop_version: None,
            security_level: self.config.security_level,
            visibility: self.config.visibility,
            custom_commands: Vec::new(),
            launched_at_unix_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
        };
        if !validate_only && let Err(e) = self.persistor.save(&info).await {
            tracing::warn!(error = %e, "failed to persist reattach information");
        }

        let (session, notifications) = SessionController::new(SessionParts {
            process,
            engine_lock: engine,
            artifact,
            reattach: info,
            transport: self.transport.clone(),
            persistor: self.persistor.clone(),
            registry: self.registry.clone(),
            settings: self.settings(validate_only),
            initial_state: LifecycleState::Launching,
        });
        session.begin_handshake();
        Ok((session, notifications))
    }

    /// Adopts the process described by a persisted reattach record.
    pub async fn reattach(
        &self,
        info: ReattachInformation,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Session> {
        let pid = info.process_id;
        let process = EngineProcess::attach(pid).map_err(|_| {
            job_error::anyhow(
                ErrorCode::ReattachProcessMissing,
                format!("engine process {pid} is no longer running"),
                Some("the server has to be launched again"),
            )
        })?;
        let engine = match self
            .engines
            .use_executables(Some(info.engine_version()), None, cancel)
            .await
        {
            Ok(engine) => engine,
            Err(e) if cancel.is_cancelled() => {
                // Hand the process back to the next attempt.
                if let Err(save) = self.persistor.save(&info).await {
                    tracing::warn!(pid, error = %format!("{save:#}"), "failed to restore reattach information");
                }
                return Err(e);
            }
            Err(e) => {
                tracing::error!(
                    pid,
                    error = %format!("{e:#}"),
                    "engine of the reattached process is unavailable, stopping the process"
                );
                process.terminate().await;
                return Err(e);
            }
        };

        let compatible = info
            .interop_version
            .is_some_and(|v| v.is_compatible_with(&INTEROP_VERSION));
        if !compatible {
            tracing::warn!(
                pid,
                interop = ?info.interop_version.map(|v| v.to_string()),
                supported = %INTEROP_VERSION,
                "reattached process has no compatible interop, running degraded"
            );
        }

        let artifact = ArtifactLease::new(info.artifact.clone());
        let (session, notifications) = SessionController::new(SessionParts {
            process,
            engine_lock: engine,
            artifact,
            reattach: info,
            transport: self.transport.clone(),
            persistor: self.persistor.clone(),
            registry: self.registry.clone(),
            settings: self.settings(false),
            initial_state: LifecycleState::AwaitingHandshake,
        });

        if compatible {
            let probe = session
                .send_command_with(
                    TopicParameters::watchdog_reattach(),
                    SendOptions {
                        bypass_lifecycle: true,
                    },
                    cancel,
                )
                .await;
            match probe {
                Ok(Some(resp)) if !resp.is_error() => {
                    session.complete_reattach(resp.custom_commands).await;
                    tracing::info!(pid, "reattached to engine process");
                }
                Ok(resp) => {
                    tracing::warn!(
                        pid,
                        error = ?resp.and_then(|r| r.error_message),
                        "engine did not answer the reattach probe, waiting for its next startup"
                    );
                }
                Err(SessionError::Cancelled) => {
                    // Keep the process alive for the next attempt.
                    session.release().await?;
                    return Err(Cancelled.into());
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "reattach probe failed");
                }
            }
        }
        Ok((session, notifications))
    }
}
