use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use anyhow::Context;
use tether_interop::EngineVersion;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    engine_installation::{self, EngineInstallation, InstallStatus, VERSION_MARKER},
    engine_lock::{EngineExecutableLock, RefCounted},
    installer::{EngineInstaller, SharedProfileLock},
    job_error::{self, ErrorCode},
    signal::{EventListener, EventSignal},
};

pub const ACTIVE_VERSION_FILE: &str = "ActiveVersion.txt";

/// Returned when the caller's cancellation token fired first.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Owns every engine installation under one root directory.
#[derive(Clone)]
pub struct EngineManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    root: PathBuf,
    installer: Arc<dyn EngineInstaller>,
    profile_lock: SharedProfileLock,
    auto_install: bool,
    state: Mutex<ManagerState>,
    active_changed: EventSignal<EngineVersion>,
    reaper: mpsc::UnboundedSender<EngineVersion>,
}

#[derive(Default)]
struct ManagerState {
    installed: HashMap<EngineVersion, RefCounted<EngineInstallation>>,
    active: Option<EngineVersion>,
}

impl EngineManager {
    /// Must be called inside a tokio runtime: it starts the task that deletes
    /// ephemeral installations once they are released.
    pub fn new(
        root: PathBuf,
        installer: Arc<dyn EngineInstaller>,
        profile_lock: SharedProfileLock,
        auto_install: bool,
    ) -> Self {
        let (reaper, reaper_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            root,
            installer,
            profile_lock,
            auto_install,
            state: Mutex::new(ManagerState::default()),
            active_changed: EventSignal::new(),
            reaper,
        });
        tokio::spawn(reap_ephemeral(Arc::downgrade(&inner), reaper_rx));
        Self { inner }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub async fn active_version(&self) -> Option<EngineVersion> {
        self.inner.state.lock().await.active.clone()
    }

    pub fn active_listener(&self) -> EventListener<EngineVersion> {
        self.inner.active_changed.listener()
    }

    /// Versions whose install has completed.
    pub async fn list_installed(&self) -> Vec<EngineVersion> {
        let state = self.inner.state.lock().await;
        let mut out: Vec<EngineVersion> = state
            .installed
            .iter()
            .filter(|(_, c)| c.value().status() == InstallStatus::Ready)
            .map(|(v, _)| v.clone())
            .collect();
        out.sort_by_key(|v| v.to_string());
        out
    }

    /// Leases the executables of `required` (or the active version), installing them first
    /// when permitted.
    pub async fn use_executables(
        &self,
        required: Option<&EngineVersion>,
        trust_path: Option<&Path>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<EngineExecutableLock> {
        let lease = {
            let mut state = self.inner.state.lock().await;
            let version = match required {
                Some(v) => v.clone(),
                None => state.active.clone().ok_or_else(|| {
                    job_error::anyhow(
                        ErrorCode::NoActiveEngine,
                        "no engine version is active",
                        Some("install and activate an engine version first"),
                    )
                })?,
            };
            let container = match state.installed.get(&version) {
                Some(c) => c.clone(),
                None if self.inner.auto_install => {
                    // Installed on demand for this caller only.
                    let ephemeral = state.active.as_ref() != Some(&version);
                    self.inner.begin_install(&mut state, version, None, ephemeral)
                }
                None => {
                    return Err(job_error::anyhow(
                        ErrorCode::EngineVersionNotInstalled,
                        format!("engine version {version} is not installed"),
                        None,
                    ));
                }
            };
            container.lease()
        };

        let lock = EngineExecutableLock::new(lease, Some(self.inner.reaper.clone()));
        tokio::select! {
            res = lock.installation().wait_installed() => res?,
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        }

        if let Some(path) = trust_path {
            let _profile = self.inner.profile_lock.lock().await;
            self.inner
                .installer
                .trust_path(lock.installation(), path)
                .await
                .map_err(|e| {
                    job_error::anyhow(
                        ErrorCode::EngineTrustFailed,
                        format!("could not trust {}: {e:#}", path.display()),
                        None,
                    )
                })?;
        }

        Ok(lock)
    }

    /// Makes `version` the active one, installing it first if needed. A custom archive
    /// is installed as the next free custom iteration of `version`.
    pub async fn change_version(
        &self,
        version: &EngineVersion,
        custom_archive: Option<Vec<u8>>,
        allow_install: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<EngineVersion> {
        let (container, target, lease) = {
            let mut state = self.inner.state.lock().await;
            let target = match custom_archive {
                Some(_) => {
                    let next = state
                        .installed
                        .keys()
                        .filter(|v| v.same_release(version))
                        .filter_map(|v| v.custom_iteration)
                        .max()
                        .unwrap_or(0)
                        + 1;
                    version.with_custom_iteration(next)
                }
                None => version.clone(),
            };
            let container = match state.installed.get(&target) {
                Some(c) => c.clone(),
                None if allow_install || custom_archive.is_some() => {
                    self.inner
                        .begin_install(&mut state, target.clone(), custom_archive, false)
                }
                None => {
                    return Err(job_error::anyhow(
                        ErrorCode::EngineVersionNotInstalled,
                        format!("engine version {target} is not installed"),
                        Some("allow installation or install it first"),
                    ));
                }
            };
            let lease = container.lease();
            (container, target, lease)
        };

        tokio::select! {
            res = container.value().wait_installed() => res?,
            _ = cancel.cancelled() => return Err(Cancelled.into()),
        }

        {
            let mut state = self.inner.state.lock().await;
            let still_registered = state
                .installed
                .get(&target)
                .is_some_and(|c| c.ptr_eq(&container));
            if !still_registered {
                anyhow::bail!("engine version {target} was removed while activating it");
            }
            write_active(&self.inner.root, Some(&target))?;
            state.active = Some(target.clone());
        }
        drop(lease);

        self.inner.active_changed.fire(target.clone());
        tracing::info!(version = %target, "active engine version changed");
        Ok(target)
    }

    /// Deletes an installed version once nobody holds it. The active version is never
    /// deleted.
    pub async fn delete_version(
        &self,
        version: &EngineVersion,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.inner.delete_version(version, cancel).await
    }

    /// Re-registers installations found on disk and deletes directories without a valid
    /// version marker. Returns the recovered versions.
    pub async fn recover(&self) -> anyhow::Result<Vec<EngineVersion>> {
        let root = self.inner.root.clone();
        let (found, orphans) = tokio::task::spawn_blocking(move || scan_root(&root))
            .await
            .context("scan task panicked")??;

        for orphan in orphans {
            tracing::warn!(path = %orphan.display(), "deleting engine directory without a version marker");
            if let Err(e) = tokio::fs::remove_dir_all(&orphan).await {
                tracing::warn!(path = %orphan.display(), error = %e, "failed to delete orphaned engine directory");
            }
        }

        let mut recovered = Vec::with_capacity(found.len());
        {
            let mut state = self.inner.state.lock().await;
            for (dir, version) in found {
                let installation = EngineInstallation::installed(version.clone(), dir);
                if let Err(e) = self.inner.installer.upgrade_installation(&installation).await {
                    tracing::warn!(version = %version, error = %format!("{e:#}"), "engine upgrade hook failed");
                }
                state
                    .installed
                    .insert(version.clone(), RefCounted::new(installation));
                recovered.push(version);
            }

            let previous = read_active(&self.inner.root);
            match previous {
                Some(v) if state.installed.contains_key(&v) => {
                    tracing::info!(version = %v, "restored active engine version");
                    state.active = Some(v);
                }
                Some(v) => {
                    tracing::warn!(version = %v, "previously active engine version is gone");
                    write_active(&self.inner.root, None)?;
                }
                None => {}
            }
        }

        recovered.sort_by_key(|v| v.to_string());
        tracing::info!(count = recovered.len(), "recovered engine installations");
        Ok(recovered)
    }
}

impl ManagerInner {
    fn begin_install(
        self: &Arc<Self>,
        state: &mut ManagerState,
        version: EngineVersion,
        custom_archive: Option<Vec<u8>>,
        ephemeral: bool,
    ) -> RefCounted<EngineInstallation> {
        let (tx, rx) = watch::channel(InstallStatus::Pending);
        let dir = self.root.join(version.to_string());
        let container = RefCounted::new(EngineInstallation::new(
            version.clone(),
            dir.clone(),
            ephemeral,
            rx,
        ));
        state.installed.insert(version.clone(), container.clone());

        let inner = self.clone();
        let provisional = container.clone();
        tokio::spawn(async move {
            tracing::info!(version = %version, ephemeral, "installing engine version");
            match inner.run_install(&version, &dir, custom_archive).await {
                Ok(()) => {
                    tx.send_replace(InstallStatus::Ready);
                    tracing::info!(version = %version, "engine version installed");
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    tracing::warn!(version = %version, error = %reason, "engine install failed");
                    // Clear the directory while still registered so a retry cannot race it.
                    let _ = tokio::fs::remove_dir_all(&dir).await;
                    {
                        let mut state = inner.state.lock().await;
                        if state
                            .installed
                            .get(&version)
                            .is_some_and(|c| c.ptr_eq(&provisional))
                        {
                            state.installed.remove(&version);
                        }
                    }
                    tx.send_replace(InstallStatus::Failed(Arc::from(reason)));
                }
            }
        });

        container
    }

    async fn run_install(
        &self,
        version: &EngineVersion,
        dir: &Path,
        custom_archive: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("clear stale {}", dir.display()))?;
        }
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        self.installer.install(version, dir, custom_archive).await?;
        engine_installation::write_marker(dir, version)?;
        Ok(())
    }

    async fn delete_version(
        &self,
        version: &EngineVersion,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let cannot_delete_active = || {
            job_error::anyhow(
                ErrorCode::CannotDeleteActiveEngine,
                format!("engine version {version} is active"),
                Some("activate a different version first"),
            )
        };

        loop {
            let (container, mut active_changed) = {
                let state = self.state.lock().await;
                if state.active.as_ref() == Some(version) {
                    return Err(cannot_delete_active());
                }
                let Some(container) = state.installed.get(version).cloned() else {
                    return Err(job_error::anyhow(
                        ErrorCode::EngineVersionNotInstalled,
                        format!("engine version {version} is not installed"),
                        None,
                    ));
                };
                (container, self.active_changed.listener())
            };

            // A failed install evicts itself; the next pass reports it as not installed.
            tokio::select! {
                _ = container.value().wait_installed() => {}
                _ = cancel.cancelled() => return Err(Cancelled.into()),
            }

            tokio::select! {
                _ = container.wait_for_zero() => {}
                _ = active_changed.wait() => continue,
                _ = cancel.cancelled() => return Err(Cancelled.into()),
            }

            {
                let mut state = self.state.lock().await;
                if state.active.as_ref() == Some(version) {
                    return Err(cannot_delete_active());
                }
                match state.installed.get(version) {
                    Some(c) if c.ptr_eq(&container) => {}
                    Some(_) => continue,
                    None => return Ok(()),
                }
                if container.count() != 0 {
                    continue;
                }
                state.installed.remove(version);
            }

            let dir = container.value().root().to_path_buf();
            tokio::task::spawn_blocking(move || remove_installation_dir(&dir))
                .await
                .context("delete task panicked")??;
            tracing::info!(version = %version, "engine version deleted");
            return Ok(());
        }
    }
}

async fn reap_ephemeral(
    inner: Weak<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<EngineVersion>,
) {
    while let Some(version) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(e) = inner.reap_if_unused(&version).await {
            tracing::warn!(version = %version, error = %format!("{e:#}"), "failed to delete ephemeral engine");
        }
    }
}

impl ManagerInner {
    /// Deletes an ephemeral version only if nothing holds it right now. A version that was
    /// leased again is skipped; its next release queues it once more.
    async fn reap_if_unused(&self, version: &EngineVersion) -> anyhow::Result<()> {
        // Held through the delete so a new install cannot reuse the directory mid-removal.
        let mut state = self.state.lock().await;
        if state.active.as_ref() == Some(version) {
            return Ok(());
        }
        let Some(container) = state.installed.get(version) else {
            return Ok(());
        };
        if container.count() != 0 || !matches!(container.value().status(), InstallStatus::Ready) {
            tracing::debug!(version = %version, "ephemeral engine in use, kept");
            return Ok(());
        }
        let dir = container.value().root().to_path_buf();
        state.installed.remove(version);
        tokio::task::spawn_blocking(move || remove_installation_dir(&dir))
            .await
            .context("delete task panicked")??;
        drop(state);
        tracing::info!(version = %version, "ephemeral engine version deleted");
        Ok(())
    }
}

// The marker goes first so an interrupted delete leaves an orphan, never a
// half-deleted installation that looks valid.
fn remove_installation_dir(dir: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(dir.join(VERSION_MARKER)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("delete marker in {}", dir.display())),
    }
    std::fs::remove_dir_all(dir).with_context(|| format!("delete {}", dir.display()))
}

type ScanResult = (Vec<(PathBuf, EngineVersion)>, Vec<PathBuf>);

fn scan_root(root: &Path) -> anyhow::Result<ScanResult> {
    std::fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
    let mut found = Vec::new();
    let mut orphans = Vec::new();
    let mut seen = HashSet::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        match engine_installation::read_marker(&path) {
            Some(version) if seen.insert(version.clone()) => found.push((path, version)),
            _ => orphans.push(path),
        }
    }
    Ok((found, orphans))
}

fn read_active(root: &Path) -> Option<EngineVersion> {
    let raw = std::fs::read_to_string(root.join(ACTIVE_VERSION_FILE)).ok()?;
    raw.trim().parse().ok()
}

fn write_active(root: &Path, version: Option<&EngineVersion>) -> anyhow::Result<()> {
    let path = root.join(ACTIVE_VERSION_FILE);
    match version {
        Some(v) => {
            std::fs::create_dir_all(root)?;
            let tmp = root.join(format!("{ACTIVE_VERSION_FILE}.tmp"));
            std::fs::write(&tmp, v.to_string())?;
            std::fs::rename(&tmp, &path).with_context(|| format!("write {}", path.display()))?;
        }
        None => match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("delete {}", path.display())),
        },
    }
    Ok(())
}
