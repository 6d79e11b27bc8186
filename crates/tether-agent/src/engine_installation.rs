use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tether_interop::{EngineKind, EngineVersion};
use tokio::sync::watch;

use crate::{
    job_error::{ErrorCode, JobError},
    launch::{self, ArgumentFormatter, LaunchArguments},
};

/// Written last by an install and deleted first by a delete, so a directory with a
/// parseable marker is always a complete installation.
pub const VERSION_MARKER: &str = "Version.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    Pending,
    Ready,
    Failed(Arc<str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Server output can be read from stdout/stderr.
    pub stdout_capture: bool,
    /// The server asks before opening network access unless its path is trusted.
    pub prompts_for_network_access: bool,
    /// Topics go to a port distinct from the game port.
    pub separate_topic_port: bool,
}

impl EngineCapabilities {
    pub fn for_kind(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Byond => Self {
                stdout_capture: false,
                prompts_for_network_access: true,
                separate_topic_port: false,
            },
            EngineKind::OpenDream => Self {
                stdout_capture: true,
                prompts_for_network_access: false,
                separate_topic_port: true,
            },
        }
    }
}

/// One installed (or installing) engine version on disk.
#[derive(Debug)]
pub struct EngineInstallation {
    version: EngineVersion,
    root: PathBuf,
    ephemeral: bool,
    status: watch::Receiver<InstallStatus>,
}

impl EngineInstallation {
    pub fn new(
        version: EngineVersion,
        root: PathBuf,
        ephemeral: bool,
        status: watch::Receiver<InstallStatus>,
    ) -> Self {
        Self {
            version,
            root,
            ephemeral,
            status,
        }
    }

    /// An installation already complete on disk.
    pub fn installed(version: EngineVersion, root: PathBuf) -> Self {
        let (_tx, rx) = watch::channel(InstallStatus::Ready);
        Self::new(version, root, false, rx)
    }

    pub fn version(&self) -> &EngineVersion {
        &self.version
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deleted in the background once nobody holds it any more.
    pub fn ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn server_exe(&self) -> PathBuf {
        match self.version.engine {
            EngineKind::Byond => self.root.join("bin").join("DreamDaemon"),
            EngineKind::OpenDream => self.root.join("bin").join("server").join("Robust.Server"),
        }
    }

    pub fn compiler_exe(&self) -> PathBuf {
        match self.version.engine {
            EngineKind::Byond => self.root.join("bin").join("DreamMaker"),
            EngineKind::OpenDream => self.root.join("bin").join("compiler").join("DMCompiler"),
        }
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::for_kind(self.version.engine)
    }

    fn formatter(&self) -> ArgumentFormatter {
        match self.version.engine {
            EngineKind::Byond => launch::byond_arguments,
            EngineKind::OpenDream => launch::open_dream_arguments,
        }
    }

    pub fn format_arguments(&self, args: &LaunchArguments) -> Vec<String> {
        (self.formatter())(args)
    }

    pub fn status(&self) -> InstallStatus {
        self.status.borrow().clone()
    }

    /// Resolves once the on-disk install finished. A dropped installer counts as failure.
    pub async fn wait_installed(&self) -> Result<(), JobError> {
        let mut rx = self.status.clone();
        let status = match rx.wait_for(|s| !matches!(s, InstallStatus::Pending)).await {
            Ok(s) => s.clone(),
            Err(_) => InstallStatus::Failed(Arc::from("installation was abandoned")),
        };
        let reason = match status {
            InstallStatus::Ready => return Ok(()),
            InstallStatus::Failed(reason) => reason,
            InstallStatus::Pending => Arc::from("installation never settled"),
        };
        Err(JobError::new(
            ErrorCode::EngineInstallFailed,
            format!("installing {} failed: {reason}", self.version),
        ))
    }
}

pub fn read_marker(dir: &Path) -> Option<EngineVersion> {
    let raw = std::fs::read_to_string(dir.join(VERSION_MARKER)).ok()?;
    raw.trim().parse().ok()
}

pub fn write_marker(dir: &Path, version: &EngineVersion) -> anyhow::Result<()> {
    let path = dir.join(VERSION_MARKER);
    let tmp = dir.join(format!("{VERSION_MARKER}.tmp"));
    std::fs::write(&tmp, version.to_string()).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tether_interop::{DottedVersion, SecurityLevel, Visibility};

    use super::*;

    fn byond() -> EngineVersion {
        EngineVersion::new(EngineKind::Byond, DottedVersion::new(515, 1633))
    }

    #[test]
    fn executable_layout_follows_engine_kind() {
        let inst = EngineInstallation::installed(byond(), PathBuf::from("/e/b"));
        assert_eq!(inst.server_exe(), PathBuf::from("/e/b/bin/DreamDaemon"));
        assert_eq!(inst.compiler_exe(), PathBuf::from("/e/b/bin/DreamMaker"));
        assert!(inst.capabilities().prompts_for_network_access);

        let od = EngineVersion::new(EngineKind::OpenDream, DottedVersion::with_patch(0, 2, 0));
        let inst = EngineInstallation::installed(od, PathBuf::from("/e/o"));
        assert_eq!(inst.server_exe(), PathBuf::from("/e/o/bin/server/Robust.Server"));
        assert!(inst.capabilities().stdout_capture);
    }

    #[test]
    fn capabilities_follow_engine_kind() {
        let byond = EngineCapabilities::for_kind(EngineKind::Byond);
        assert!(!byond.stdout_capture);
        assert!(!byond.separate_topic_port);
        let od = EngineCapabilities::for_kind(EngineKind::OpenDream);
        assert!(od.stdout_capture);
        assert!(od.separate_topic_port);
        assert!(!od.prompts_for_network_access);
    }

    #[test]
    fn arguments_use_the_kind_formatter() {
        let inst = EngineInstallation::installed(byond(), PathBuf::from("/e/b"));
        let args = LaunchArguments {
            artifact_path: PathBuf::from("w.dmb"),
            port: 1234,
            topic_port: None,
            security_level: SecurityLevel::Trusted,
            visibility: Visibility::Private,
            allow_webclient: false,
            log_file: None,
            params: String::new(),
        };
        let line = inst.format_arguments(&args);
        assert_eq!(line[0], "w.dmb");
        assert!(line.iter().any(|s| s == "-trusted"));
    }

    #[tokio::test]
    async fn waiters_see_install_outcome() {
        let (tx, rx) = watch::channel(InstallStatus::Pending);
        let inst = Arc::new(EngineInstallation::new(byond(), PathBuf::from("/e/b"), false, rx));
        let waiter = {
            let inst = inst.clone();
            tokio::spawn(async move { inst.wait_installed().await })
        };
        tx.send_replace(InstallStatus::Failed(Arc::from("disk full")));
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::EngineInstallFailed);
        assert!(err.message.contains("disk full"));
    }

    #[tokio::test]
    async fn dropped_installer_fails_waiters() {
        let (tx, rx) = watch::channel(InstallStatus::Pending);
        let inst = EngineInstallation::new(byond(), PathBuf::from("/e/b"), false, rx);
        drop(tx);
        assert!(inst.wait_installed().await.is_err());
    }

    #[test]
    fn marker_round_trip() {
        let dir = std::env::temp_dir().join(format!("tether-marker-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(read_marker(&dir), None);
        let v = byond().with_custom_iteration(2);
        write_marker(&dir, &v).unwrap();
        assert_eq!(read_marker(&dir), Some(v));
        std::fs::remove_dir_all(&dir).ok();
    }
}
