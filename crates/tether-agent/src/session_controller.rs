use std::{
    future::Future,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use futures_util::future::BoxFuture;
use tether_interop::{
    ChatCommand, ChatMessage, CustomCommand, EngineEvent, EventNotification, ReattachInformation,
    RebootState, TopicParameters, TopicResponse,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    artifact::ArtifactLease,
    bridge_service::{BridgeHandler, BridgeRegistration, BridgeRegistry},
    chunking::ChunkAssembler,
    engine_lock::EngineExecutableLock,
    engine_process::EngineProcess,
    job_error::JobError,
    reattach::ReattachPersistor,
    signal::EventSignal,
    topic_client::TopicTransport,
};

mod bridge;
mod topic;

pub use topic::SendOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Launching,
    AwaitingHandshake,
    Running,
    RebootPending,
    Terminated,
}

/// What the process asked for when it last introduced itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiValidationStatus {
    NeverValidated,
    BadValidationRequest,
    Incompatible,
    RequiresTrusted,
    RequiresSafe,
    RequiresUltrasafe,
}

/// Things the process told the supervisor that the owner of the session acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    ChatSend(ChatMessage),
    Prime,
    Event(EngineEvent),
    CustomCommandsChanged(Vec<CustomCommand>),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub instance_name: String,
    pub startup_timeout: Duration,
    pub validation_grace: Duration,
    pub reboot_gate_timeout: Duration,
    pub validate_only: bool,
}

/// How the initial startup went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchResult {
    /// Time from launch to the startup handshake, if it happened in time.
    pub startup_time: Option<Duration>,
    /// Set when the process exited before handshaking.
    pub exit_code: Option<i32>,
    pub exited: bool,
}

pub type RebootGate = BoxFuture<'static, ()>;

/// Everything a session is built from.
pub struct SessionParts {
    pub process: EngineProcess,
    pub engine_lock: EngineExecutableLock,
    pub artifact: ArtifactLease,
    pub reattach: ReattachInformation,
    pub transport: Arc<dyn TopicTransport>,
    pub persistor: Arc<dyn ReattachPersistor>,
    pub registry: BridgeRegistry,
    pub settings: SessionSettings,
    pub initial_state: LifecycleState,
}

/// One supervised engine process: the bridge endpoint it talks to, the topic channel
/// the supervisor talks back on, and the resources it holds.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    me: Weak<SessionInner>,
    process: EngineProcess,
    engine_lock: Mutex<Option<EngineExecutableLock>>,
    artifact: Mutex<Option<ArtifactLease>>,
    transport: Arc<dyn TopicTransport>,
    /// FIFO: tokio's mutex queues waiters in order.
    topic_lock: tokio::sync::Mutex<()>,
    reattach: Mutex<ReattachInformation>,
    persistor: Arc<dyn ReattachPersistor>,
    lifecycle: watch::Sender<LifecycleState>,
    api_validation: Mutex<ApiValidationStatus>,
    reboot: EventSignal<RebootState>,
    reboot_gate: Mutex<Option<RebootGate>>,
    chunks: Mutex<ChunkAssembler>,
    next_payload_id: AtomicU32,
    notifications: mpsc::UnboundedSender<SessionNotification>,
    /// Cancelled when the process exits or the session is disposed.
    shutdown: CancellationToken,
    launched_at: Instant,
    startup_time: Mutex<Option<Duration>>,
    released: AtomicBool,
    disposed: AtomicBool,
    terminated_intentionally: AtomicBool,
    settings: SessionSettings,
    registration: Mutex<Option<BridgeRegistration>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionController {
    /// Registers the session with the bridge and starts watching the process.
    pub fn new(parts: SessionParts) -> (Self, mpsc::UnboundedReceiver<SessionNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let SessionParts {
            process,
            engine_lock,
            artifact,
            reattach,
            transport,
            persistor,
            registry,
            settings,
            initial_state,
        } = parts;
        let access_identifier = reattach.access_identifier.clone();
        let (lifecycle, _) = watch::channel(initial_state);

        let inner = Arc::new_cyclic(|me: &Weak<SessionInner>| {
            let handler: Weak<dyn BridgeHandler> = me.clone();
            SessionInner {
                me: me.clone(),
                process,
                engine_lock: Mutex::new(Some(engine_lock)),
                artifact: Mutex::new(Some(artifact)),
                transport,
                topic_lock: tokio::sync::Mutex::new(()),
                reattach: Mutex::new(reattach),
                persistor,
                lifecycle,
                api_validation: Mutex::new(ApiValidationStatus::NeverValidated),
                reboot: EventSignal::new(),
                reboot_gate: Mutex::new(None),
                chunks: Mutex::new(ChunkAssembler::default()),
                next_payload_id: AtomicU32::new(0),
                notifications: tx,
                shutdown: CancellationToken::new(),
                launched_at: Instant::now(),
                startup_time: Mutex::new(None),
                released: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                terminated_intentionally: AtomicBool::new(false),
                settings,
                registration: Mutex::new(Some(registry.register(&access_identifier, handler))),
            }
        });

        let exit = inner.process.wait_exit();
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let code = exit.await;
            if let Some(inner) = weak.upgrade() {
                inner.on_process_exit(code).await;
            }
        });

        (Self { inner }, rx)
    }

    pub fn process_id(&self) -> u32 {
        self.inner.process.id()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.inner.lifecycle.borrow()
    }

    pub fn lifecycle_watch(&self) -> watch::Receiver<LifecycleState> {
        self.inner.lifecycle.subscribe()
    }

    pub fn api_validation(&self) -> ApiValidationStatus {
        *lock(&self.inner.api_validation)
    }

    pub fn reattach_information(&self) -> ReattachInformation {
        lock(&self.inner.reattach).clone()
    }

    pub fn reboot_state(&self) -> RebootState {
        lock(&self.inner.reattach).reboot_state
    }

    pub fn custom_commands(&self) -> Vec<CustomCommand> {
        lock(&self.inner.reattach).custom_commands.clone()
    }

    pub async fn send_command(
        &self,
        params: TopicParameters,
        cancel: &CancellationToken,
    ) -> Result<Option<TopicResponse>, SessionError> {
        self.inner
            .send_command(params, SendOptions::default(), cancel)
            .await
    }

    pub async fn send_command_with(
        &self,
        params: TopicParameters,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<TopicResponse>, SessionError> {
        self.inner.send_command(params, options, cancel).await
    }

    /// Records the new state and tells the process. Returns whether the process
    /// acknowledged it; the state applies at the next reboot either way.
    pub async fn set_reboot_state(
        &self,
        state: RebootState,
        cancel: &CancellationToken,
    ) -> Result<bool, SessionError> {
        {
            let mut info = lock(&self.inner.reattach);
            if info.reboot_state == state {
                return Ok(true);
            }
            info.reboot_state = state;
        }
        self.inner.persist().await;
        let resp = self
            .send_command(TopicParameters::change_reboot_state(state), cancel)
            .await?;
        Ok(resp.is_some_and(|r| !r.is_error()))
    }

    /// Moves the server to another port. The new port is only recorded once the
    /// process confirms it.
    pub async fn set_port(&self, port: u16, cancel: &CancellationToken) -> Result<bool, SessionError> {
        if lock(&self.inner.reattach).port == port {
            return Ok(true);
        }
        let resp = self
            .send_command(TopicParameters::change_port(port), cancel)
            .await?;
        match resp {
            Some(r) if !r.is_error() => {
                lock(&self.inner.reattach).port = port;
                self.inner.persist().await;
                tracing::info!(port, "engine port changed");
                Ok(true)
            }
            Some(r) => {
                tracing::warn!(port, error = ?r.error_message, "engine refused port change");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub async fn instance_renamed(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TopicResponse>, SessionError> {
        self.send_command(TopicParameters::instance_renamed(name), cancel)
            .await
    }

    pub async fn send_chat_command(
        &self,
        command: ChatCommand,
        cancel: &CancellationToken,
    ) -> Result<Option<TopicResponse>, SessionError> {
        self.send_command(TopicParameters::chat_command(command), cancel)
            .await
    }

    pub async fn send_event_notification(
        &self,
        event: EventNotification,
        cancel: &CancellationToken,
    ) -> Result<Option<TopicResponse>, SessionError> {
        self.send_command(TopicParameters::event_notification(event), cancel)
            .await
    }

    /// True when the process answered without an error. Works outside Running.
    pub async fn heartbeat(&self, cancel: &CancellationToken) -> Result<bool, SessionError> {
        let resp = self
            .send_command_with(
                TopicParameters::heartbeat(),
                SendOptions {
                    bypass_lifecycle: true,
                },
                cancel,
            )
            .await?;
        Ok(resp.is_some_and(|r| !r.is_error()))
    }

    /// The next reboot handshake waits for `gate` (bounded by the reboot gate timeout)
    /// before letting the process continue.
    pub fn set_reboot_gate(&self, gate: impl Future<Output = ()> + Send + 'static) {
        *lock(&self.inner.reboot_gate) = Some(Box::pin(gate));
    }

    /// Swaps in the build the process will load on its next reboot.
    pub async fn replace_artifact(&self, artifact: ArtifactLease) -> Option<ArtifactLease> {
        lock(&self.inner.reattach).artifact = artifact.artifact().clone();
        let old = lock(&self.inner.artifact).replace(artifact);
        self.inner.persist().await;
        old
    }

    /// Lets the process outlive this supervisor: the reattach record is persisted and
    /// the engine installation is kept.
    pub async fn release(&self) -> anyhow::Result<()> {
        self.inner.released.store(true, Ordering::SeqCst);
        if let Some(engine) = lock(&self.inner.engine_lock).as_ref() {
            engine.do_not_delete_this_session();
        }
        let info = self.reattach_information();
        self.inner.persistor.save(&info).await?;
        tracing::info!(pid = info.process_id, "session released");
        self.inner.dispose().await;
        Ok(())
    }

    pub fn released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Waits (up to the startup timeout) for the first handshake or for the process to
    /// die trying.
    pub async fn launch_result(&self) -> LaunchResult {
        let mut rx = self.inner.lifecycle.subscribe();
        let reached = tokio::time::timeout(
            self.inner.settings.startup_timeout,
            rx.wait_for(|s| matches!(s, LifecycleState::Running | LifecycleState::Terminated)),
        )
        .await
        .ok()
        .and_then(|r| r.ok().map(|s| *s));

        match reached {
            Some(LifecycleState::Running) => LaunchResult {
                startup_time: *lock(&self.inner.startup_time),
                exit_code: None,
                exited: false,
            },
            Some(_) => LaunchResult {
                startup_time: None,
                exit_code: self.inner.process.lifetime().await,
                exited: true,
            },
            None => {
                tracing::warn!(
                    timeout_secs = self.inner.settings.startup_timeout.as_secs(),
                    "engine did not complete startup in time"
                );
                LaunchResult {
                    startup_time: None,
                    exit_code: None,
                    exited: self.inner.process.has_exited(),
                }
            }
        }
    }

    pub async fn lifetime(&self) -> Option<i32> {
        self.inner.process.lifetime().await
    }

    /// Resolves with the reboot state of the next reboot after this call.
    pub fn on_reboot(&self) -> impl Future<Output = Option<RebootState>> + Send + 'static {
        let mut listener = self.inner.reboot.listener();
        async move { listener.wait().await }
    }

    pub async fn terminate(&self) {
        self.inner.terminate().await;
    }

    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// The process is up and registered; the next step is its startup call.
    pub(crate) fn begin_handshake(&self) {
        self.inner.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::Launching {
                *state = LifecycleState::AwaitingHandshake;
                true
            } else {
                false
            }
        });
    }

    /// A reattached process answered: take its commands and resume normal traffic.
    pub(crate) async fn complete_reattach(&self, custom_commands: Option<Vec<CustomCommand>>) {
        if let Some(commands) = custom_commands {
            lock(&self.inner.reattach).custom_commands = commands.clone();
            self.inner
                .notify(SessionNotification::CustomCommandsChanged(commands));
        }
        self.inner.persist().await;
        self.inner.set_lifecycle(LifecycleState::Running);
    }
}

impl SessionInner {
    fn access_identifier(&self) -> String {
        lock(&self.reattach).access_identifier.clone()
    }

    fn set_lifecycle(&self, state: LifecycleState) {
        let previous = self.lifecycle.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "session lifecycle");
        }
    }

    fn notify(&self, notification: SessionNotification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!("session notification dropped, no receiver");
        }
    }

    async fn persist(&self) {
        if self.settings.validate_only {
            return;
        }
        if self.disposed.load(Ordering::SeqCst) && !self.released.load(Ordering::SeqCst) {
            return;
        }
        let info = lock(&self.reattach).clone();
        if let Err(e) = self.persistor.save(&info).await {
            tracing::warn!(error = %e, "failed to persist reattach information");
        }
    }

    async fn on_process_exit(&self, code: Option<i32>) {
        self.shutdown.cancel();
        self.set_lifecycle(LifecycleState::Terminated);
        if self.disposed.load(Ordering::SeqCst) || self.released.load(Ordering::SeqCst) {
            return;
        }
        if self.terminated_intentionally.load(Ordering::SeqCst) {
            tracing::info!(?code, "engine process stopped");
        } else {
            tracing::warn!(?code, "engine process exited unexpectedly");
        }
        if let Err(e) = self.persistor.clear().await {
            tracing::warn!(error = %e, "failed to clear reattach information");
        }
    }

    async fn terminate(&self) {
        self.terminated_intentionally.store(true, Ordering::SeqCst);
        self.process.terminate().await;
        self.shutdown.cancel();
        self.set_lifecycle(LifecycleState::Terminated);
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if !self.released.load(Ordering::SeqCst) {
            self.terminate().await;
            if let Err(e) = self.persistor.clear().await {
                tracing::warn!(error = %e, "failed to clear reattach information");
            }
        }
        self.release_resources();
        self.set_lifecycle(LifecycleState::Terminated);
        tracing::debug!(pid = self.process.id(), "session disposed");
    }

    fn release_resources(&self) {
        if let Some(engine) = lock(&self.engine_lock).take() {
            engine.dispose();
        }
        if let Some(artifact) = lock(&self.artifact).take() {
            artifact.dispose();
        }
        lock(&self.registration).take();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(pid = self.process.id(), "session dropped without dispose");
        self.shutdown.cancel();
        if !self.released.load(Ordering::SeqCst) {
            self.terminated_intentionally.store(true, Ordering::SeqCst);
            self.process.kill_now();
        }
        self.release_resources();
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::{
        collections::VecDeque,
        path::PathBuf,
        sync::atomic::AtomicUsize,
    };

    use tether_interop::{
        CompiledArtifact, DottedVersion, EngineKind, EngineVersion, INTEROP_VERSION,
        InteropVersion, SecurityLevel, Visibility,
    };

    use super::*;
    use crate::{
        engine_installation::EngineInstallation, engine_lock::RefCounted,
        launch::LaunchSpec, reattach::JsonFileReattachPersistor,
    };

    type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

    /// Records every query and answers through a closure. Flags overlapping sends.
    pub struct FakeTransport {
        pub queries: Mutex<Vec<String>>,
        pub in_flight: AtomicUsize,
        pub overlapped: AtomicBool,
        pub delay: Duration,
        pub hang: bool,
        pub scripted: Mutex<VecDeque<Option<String>>>,
        respond: Responder,
    }

    impl FakeTransport {
        pub fn new(respond: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
            Self {
                queries: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                overlapped: AtomicBool::new(false),
                delay: Duration::ZERO,
                hang: false,
                scripted: Mutex::new(VecDeque::new()),
                respond: Box::new(respond),
            }
        }

        pub fn ok() -> Self {
            Self::new(|_| Some(r#"{"commandResponse":"ok"}"#.to_string()))
        }

        pub fn sent(&self) -> Vec<String> {
            lock(&self.queries).clone()
        }

        /// Decodes the JSON body of a recorded `?tether_json=` query.
        pub fn decode(query: &str) -> serde_json::Value {
            let encoded = query
                .split_once('=')
                .map(|(_, v)| v)
                .unwrap_or_default();
            let json = urlencoding::decode(encoded).unwrap();
            serde_json::from_str(&json).unwrap()
        }
    }

    #[async_trait::async_trait]
    impl TopicTransport for FakeTransport {
        async fn send(
            &self,
            _port: u16,
            query: &str,
            _priority: bool,
            _timeout: Duration,
        ) -> Option<String> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            lock(&self.queries).push(query.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(reply) = lock(&self.scripted).pop_front() {
                return reply;
            }
            (self.respond)(query)
        }
    }

    pub fn artifact() -> CompiledArtifact {
        CompiledArtifact {
            compile_job_id: 3,
            directory: std::env::temp_dir(),
            artifact_name: "world.dmb".to_string(),
            engine_version: EngineVersion::new(EngineKind::Byond, DottedVersion::new(515, 1633)),
        }
    }

    pub fn reattach_info(interop: Option<InteropVersion>) -> ReattachInformation {
        ReattachInformation {
            access_identifier: "session-token".to_string(),
            process_id: 0,
            port: 5000,
            topic_port: None,
            reboot_state: RebootState::Normal,
            artifact: artifact(),
            topic_request_timeout_ms: 1000,
            interop_version: interop,
            security_level: SecurityLevel::Safe,
            visibility: Visibility::Public,
            custom_commands: Vec::new(),
            launched_at_unix_ms: 0,
        }
    }

    pub struct Fixture {
        pub session: SessionController,
        pub notifications: mpsc::UnboundedReceiver<SessionNotification>,
        pub transport: Arc<FakeTransport>,
        pub registry: BridgeRegistry,
        pub engine: RefCounted<EngineInstallation>,
        pub reattach_path: PathBuf,
    }

    pub struct FixtureOptions {
        pub transport: FakeTransport,
        pub state: LifecycleState,
        pub interop: Option<InteropVersion>,
        pub validate_only: bool,
    }

    impl Default for FixtureOptions {
        fn default() -> Self {
            Self {
                transport: FakeTransport::ok(),
                state: LifecycleState::Running,
                interop: Some(INTEROP_VERSION),
                validate_only: false,
            }
        }
    }

    pub fn fixture(options: FixtureOptions) -> Fixture {
        let spec = LaunchSpec {
            exec: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
        };
        let process = EngineProcess::spawn(&spec, &std::env::temp_dir(), false).unwrap();
        let engine = RefCounted::new(EngineInstallation::installed(
            artifact().engine_version,
            std::env::temp_dir(),
        ));
        let reattach_path = std::env::temp_dir()
            .join(format!("tether-session-{}", uuid::Uuid::new_v4()))
            .join("reattach.json");
        let mut info = reattach_info(options.interop);
        info.process_id = process.id();
        let transport = Arc::new(options.transport);
        let registry = BridgeRegistry::new();
        let (session, notifications) = SessionController::new(SessionParts {
            process,
            engine_lock: EngineExecutableLock::new(engine.lease(), None),
            artifact: ArtifactLease::new(artifact()),
            reattach: info,
            transport: transport.clone(),
            persistor: Arc::new(JsonFileReattachPersistor::new(reattach_path.clone())),
            registry: registry.clone(),
            settings: SessionSettings {
                instance_name: "test".to_string(),
                startup_timeout: Duration::from_millis(500),
                validation_grace: Duration::from_millis(100),
                reboot_gate_timeout: Duration::from_secs(5),
                validate_only: options.validate_only,
            },
            initial_state: options.state,
        });
        Fixture {
            session,
            notifications,
            transport,
            registry,
            engine,
            reattach_path,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tether_interop::{BridgeCommandType, BridgeParameters, INTEROP_VERSION};

    use super::{test_support::*, *};

    fn startup() -> BridgeParameters {
        let mut p = BridgeParameters::new(BridgeCommandType::Startup);
        p.access_identifier = Some("session-token".to_string());
        p.version = Some(INTEROP_VERSION.to_string());
        p
    }

    #[tokio::test]
    async fn launch_result_reports_startup() {
        let f = fixture(FixtureOptions {
            state: LifecycleState::AwaitingHandshake,
            ..Default::default()
        });
        let handler = f.registry.lookup("session-token").unwrap();
        let waiter = {
            let session = f.session.clone();
            tokio::spawn(async move { session.launch_result().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.process_bridge_request(startup()).await.unwrap();

        let result = waiter.await.unwrap();
        assert!(result.startup_time.is_some());
        assert!(!result.exited);
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn launch_result_reports_early_exit() {
        let f = fixture(FixtureOptions {
            state: LifecycleState::AwaitingHandshake,
            ..Default::default()
        });
        f.session.terminate().await;
        let result = f.session.launch_result().await;
        assert!(result.exited);
        assert_eq!(result.startup_time, None);
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn launch_result_times_out_without_handshake() {
        let f = fixture(FixtureOptions {
            state: LifecycleState::AwaitingHandshake,
            ..Default::default()
        });
        let result = f.session.launch_result().await;
        assert_eq!(
            result,
            LaunchResult {
                startup_time: None,
                exit_code: None,
                exited: false,
            }
        );
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_releases_everything() {
        let f = fixture(FixtureOptions::default());
        let pid = f.session.process_id();
        assert_eq!(f.engine.count(), 1);
        assert_eq!(f.registry.len(), 1);

        f.session.dispose().await;
        f.session.dispose().await;

        assert!(f.session.is_disposed());
        assert_eq!(f.session.lifecycle(), LifecycleState::Terminated);
        assert_eq!(f.engine.count(), 0);
        assert!(f.registry.is_empty());
        assert_eq!(f.session.lifetime().await, None);
        assert!(!crate::engine_process::process_exists(pid));
        assert!(!f.reattach_path.exists());
    }

    #[tokio::test]
    async fn release_keeps_the_process_and_persists() {
        let f = fixture(FixtureOptions::default());
        let pid = f.session.process_id();

        f.session.release().await.unwrap();

        assert!(f.session.released());
        assert!(crate::engine_process::process_exists(pid));
        assert!(f.reattach_path.exists());
        assert_eq!(f.engine.count(), 0);
        assert!(f.registry.is_empty());

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        std::fs::remove_dir_all(f.reattach_path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn unexpected_exit_ends_the_session() {
        let f = fixture(FixtureOptions::default());
        let mut lifecycle = f.session.lifecycle_watch();
        unsafe {
            libc::kill(f.session.process_id() as i32, libc::SIGKILL);
        }
        tokio::time::timeout(
            Duration::from_secs(5),
            lifecycle.wait_for(|s| *s == LifecycleState::Terminated),
        )
        .await
        .unwrap()
        .unwrap();

        let cancel = CancellationToken::new();
        let resp = f
            .session
            .send_command(TopicParameters::heartbeat(), &cancel)
            .await
            .unwrap();
        assert!(resp.is_none());
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn set_port_records_confirmed_port() {
        let f = fixture(FixtureOptions::default());
        let cancel = CancellationToken::new();
        assert!(f.session.set_port(5100, &cancel).await.unwrap());
        assert_eq!(f.session.reattach_information().port, 5100);

        let sent = FakeTransport::decode(&f.transport.sent()[0]);
        assert_eq!(sent["commandType"], "changePort");
        assert_eq!(sent["newPort"], 5100);
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn rejected_port_change_is_not_recorded() {
        let f = fixture(FixtureOptions {
            transport: FakeTransport::new(|_| Some(r#"{"errorMessage":"nope"}"#.to_string())),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        assert!(!f.session.set_port(5100, &cancel).await.unwrap());
        assert_eq!(f.session.reattach_information().port, 5000);
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn replace_artifact_returns_previous_lease() {
        let f = fixture(FixtureOptions::default());
        let mut next = artifact();
        next.compile_job_id = 4;
        let old = f.session.replace_artifact(ArtifactLease::new(next)).await.unwrap();
        assert_eq!(old.artifact().compile_job_id, 3);
        assert_eq!(f.session.reattach_information().artifact.compile_job_id, 4);
        f.session.dispose().await;
    }
}
