use std::{sync::atomic::Ordering, time::Duration};

use tether_interop::{
    BridgeCommandType, BridgeParameters, BridgeResponse, INTEROP_VERSION, InteropVersion,
    RebootState, RuntimeInformation, SecurityLevel,
};

use super::{ApiValidationStatus, LifecycleState, SessionInner, SessionNotification, lock};
use crate::{bridge_service::BridgeHandler, chunking::ChunkProgress};

/// How long a killed process gets to receive the bridge response first.
const KILL_DELAY: Duration = Duration::from_millis(100);

#[async_trait::async_trait]
impl BridgeHandler for SessionInner {
    async fn process_bridge_request(&self, params: BridgeParameters) -> Option<BridgeResponse> {
        let expected = self.access_identifier();
        if params.access_identifier.as_deref() != Some(expected.as_str()) {
            tracing::warn!("bridge request with wrong access identifier");
            return Some(BridgeResponse::error("access identifier mismatch"));
        }

        tracing::trace!(command = ?params.command_type, "bridge request");
        match params.command_type {
            BridgeCommandType::Startup => Some(self.handle_startup(params).await),
            BridgeCommandType::Reboot => Some(self.handle_reboot().await),
            BridgeCommandType::Kill => Some(self.handle_kill()),
            BridgeCommandType::ChatSend => Some(match params.chat_message {
                Some(message) => {
                    self.notify(SessionNotification::ChatSend(message));
                    BridgeResponse::ok()
                }
                None => BridgeResponse::error("chatSend requires chatMessage"),
            }),
            BridgeCommandType::Prime => {
                self.notify(SessionNotification::Prime);
                Some(BridgeResponse::ok())
            }
            BridgeCommandType::Event => Some(match params.event {
                Some(event) => {
                    self.notify(SessionNotification::Event(event));
                    BridgeResponse::ok()
                }
                None => BridgeResponse::error("event requires an event payload"),
            }),
            BridgeCommandType::DeprecatedPortUpdate => Some(BridgeResponse::error(
                "port updates over the bridge are no longer supported",
            )),
            BridgeCommandType::Chunk => self.handle_chunk(params).await,
            BridgeCommandType::Unknown => Some(BridgeResponse::error("unknown command type")),
        }
    }
}

impl SessionInner {
    async fn handle_startup(&self, params: BridgeParameters) -> BridgeResponse {
        // Fragments from before a (re)start will never be completed.
        lock(&self.chunks).clear();
        let version = match params.version.as_deref().map(str::parse::<InteropVersion>) {
            Some(Ok(v)) => v,
            Some(Err(e)) => {
                *lock(&self.api_validation) = ApiValidationStatus::BadValidationRequest;
                return BridgeResponse::error(format!("unparseable interop version: {e}"));
            }
            None => {
                *lock(&self.api_validation) = ApiValidationStatus::BadValidationRequest;
                return BridgeResponse::error("startup requires version");
            }
        };
        if !version.is_compatible_with(&INTEROP_VERSION) {
            *lock(&self.api_validation) = ApiValidationStatus::Incompatible;
            tracing::warn!(%version, supported = %INTEROP_VERSION, "incompatible interop version");
            return BridgeResponse::error(format!(
                "interop version {version} is incompatible with {INTEROP_VERSION}"
            ));
        }

        *lock(&self.api_validation) = match params.minimum_security_level {
            Some(SecurityLevel::Trusted) => ApiValidationStatus::RequiresTrusted,
            Some(SecurityLevel::Safe) => ApiValidationStatus::RequiresSafe,
            Some(SecurityLevel::Ultrasafe) | None => ApiValidationStatus::RequiresUltrasafe,
        };

        let custom_commands = params.custom_commands.unwrap_or_default();
        let runtime = {
            let mut info = lock(&self.reattach);
            info.interop_version = Some(version);
            if let Some(port) = params.topic_port {
                info.topic_port = Some(port);
            }
            info.custom_commands = custom_commands.clone();
            RuntimeInformation {
                instance_name: self.settings.instance_name.clone(),
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                interop_version: INTEROP_VERSION.to_string(),
                security_level: info.security_level,
                visibility: info.visibility,
                server_port: info.port,
                topic_port: info.topic_port,
                api_validate_only: self.settings.validate_only,
            }
        };
        self.notify(SessionNotification::CustomCommandsChanged(custom_commands));
        self.persist().await;

        lock(&self.startup_time).get_or_insert_with(|| self.launched_at.elapsed());
        self.set_lifecycle(LifecycleState::Running);
        tracing::info!(%version, topic_port = ?runtime.topic_port, "engine started up");

        if self.settings.validate_only {
            self.arm_validation_grace();
        }

        BridgeResponse {
            runtime_information: Some(runtime),
            ..BridgeResponse::ok()
        }
    }

    /// A validate-only run is over once it has handshaken; kill it if it lingers.
    fn arm_validation_grace(&self) {
        let weak = self.me.clone();
        let grace = self.settings.validation_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.process.has_exited() {
                tracing::warn!("validation run did not exit after startup, killing it");
                inner.terminate().await;
            }
        });
    }

    async fn handle_reboot(&self) -> BridgeResponse {
        lock(&self.chunks).clear();
        let state = lock(&self.reattach).reboot_state;
        tracing::info!(reboot_state = state.as_str(), "engine rebooting");
        self.reboot.fire(state);
        self.set_lifecycle(LifecycleState::RebootPending);

        let gate = lock(&self.reboot_gate).take();
        if let Some(gate) = gate {
            tokio::select! {
                _ = gate => {}
                _ = tokio::time::sleep(self.settings.reboot_gate_timeout) => {
                    tracing::warn!("reboot gate timed out");
                }
                _ = self.shutdown.cancelled() => {}
            }
        }

        {
            // A state requested while the gate was held belongs to the next reboot.
            let mut info = lock(&self.reattach);
            if info.reboot_state == state {
                info.reboot_state = RebootState::Normal;
            }
        }
        self.persist().await;
        if !self.shutdown.is_cancelled() {
            self.set_lifecycle(LifecycleState::Running);
        }
        BridgeResponse {
            reboot_state: Some(state),
            ..BridgeResponse::ok()
        }
    }

    fn handle_kill(&self) -> BridgeResponse {
        tracing::info!("engine asked to be killed");
        self.terminated_intentionally.store(true, Ordering::SeqCst);
        let weak = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_DELAY).await;
            if let Some(inner) = weak.upgrade() {
                inner.terminate().await;
            }
        });
        BridgeResponse::ok()
    }

    async fn handle_chunk(&self, params: BridgeParameters) -> Option<BridgeResponse> {
        let Some(chunk) = params.chunk else {
            return Some(BridgeResponse::error("chunk requires chunk data"));
        };
        let payload_id = chunk.payload_id;
        let progress = lock(&self.chunks).accept(chunk);
        match progress {
            Err(e) => {
                lock(&self.chunks).discard(payload_id);
                Some(BridgeResponse::error(format!("chunk rejected: {e}")))
            }
            Ok(ChunkProgress::Pending) => None,
            Ok(ChunkProgress::Missing(missing)) => {
                tracing::debug!(payload_id, ?missing, "bridge payload has gaps");
                Some(BridgeResponse::missing(missing))
            }
            Ok(ChunkProgress::Complete(json)) => {
                match serde_json::from_str::<BridgeParameters>(&json) {
                    Ok(inner) if inner.command_type == BridgeCommandType::Chunk => {
                        Some(BridgeResponse::error("chunked payloads cannot nest"))
                    }
                    Ok(inner) => self.process_bridge_request(inner).await,
                    Err(e) => Some(BridgeResponse::error(format!(
                        "malformed chunked bridge request: {e}"
                    ))),
                }
            }
        }
    }
}
