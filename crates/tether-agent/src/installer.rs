use std::{
    io::{Read, Seek},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use tether_interop::EngineVersion;
use tokio::sync::{Mutex, MutexGuard};

use crate::engine_installation::EngineInstallation;

/// Guards the per-user engine profile directory (trusted paths, engine config).
///
/// Constructed once at startup and handed to every component that touches the profile.
#[derive(Debug, Clone, Default)]
pub struct SharedProfileLock {
    inner: Arc<Mutex<()>>,
}

impl SharedProfileLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

/// Puts engine files on disk. The manager owns the version marker and the
/// installation directory's lifetime; installers only fill it.
#[async_trait::async_trait]
pub trait EngineInstaller: Send + Sync {
    async fn install(
        &self,
        version: &EngineVersion,
        target: &Path,
        custom_archive: Option<Vec<u8>>,
    ) -> anyhow::Result<()>;

    /// Runs for every installation found at startup.
    async fn upgrade_installation(&self, _installation: &EngineInstallation) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called with the shared profile lock held.
    async fn trust_path(
        &self,
        _installation: &EngineInstallation,
        _path: &Path,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Installs engines from unpacked builds under `source_root/<engine>/<version>`, or from a
/// caller-supplied zip archive for custom builds.
#[derive(Debug, Clone)]
pub struct DirectoryInstaller {
    source_root: PathBuf,
    profile_dir: PathBuf,
}

impl DirectoryInstaller {
    pub fn new(source_root: PathBuf, profile_dir: PathBuf) -> Self {
        Self {
            source_root,
            profile_dir,
        }
    }

    fn source_for(&self, version: &EngineVersion) -> PathBuf {
        self.source_root
            .join(version.engine.as_str())
            .join(version.version.to_string())
    }

    fn trusted_file(&self) -> PathBuf {
        self.profile_dir.join("cfg").join("trusted.txt")
    }
}

#[async_trait::async_trait]
impl EngineInstaller for DirectoryInstaller {
    async fn install(
        &self,
        version: &EngineVersion,
        target: &Path,
        custom_archive: Option<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let dest = target.to_path_buf();
        let source = self.source_for(version);
        let label = version.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            match custom_archive {
                Some(bytes) => extract_zip_safely(std::io::Cursor::new(bytes), &dest)
                    .with_context(|| format!("extract custom build for {label}")),
                None => {
                    if !source.is_dir() {
                        anyhow::bail!("no engine build for {label} at {}", source.display());
                    }
                    copy_dir_all(&source, &dest)
                        .with_context(|| format!("copy {} to {}", source.display(), dest.display()))
                }
            }
        })
        .await
        .context("install task panicked")??;
        tracing::info!(version = %version, path = %target.display(), "engine files installed");
        Ok(())
    }

    async fn upgrade_installation(&self, installation: &EngineInstallation) -> anyhow::Result<()> {
        for exe in [installation.server_exe(), installation.compiler_exe()] {
            ensure_executable(&exe)?;
        }
        Ok(())
    }

    async fn trust_path(&self, installation: &EngineInstallation, path: &Path) -> anyhow::Result<()> {
        if !installation.capabilities().prompts_for_network_access {
            return Ok(());
        }
        let file = self.trusted_file();
        let entry = path.to_string_lossy().into_owned();
        let existing = match tokio::fs::read_to_string(&file).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("read {}", file.display())),
        };
        if existing.lines().any(|l| l.trim() == entry) {
            return Ok(());
        }

        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = existing;
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&entry);
        out.push('\n');
        let tmp = file.with_extension("txt.tmp");
        tokio::fs::write(&tmp, out).await?;
        tokio::fs::rename(&tmp, &file).await?;
        tracing::info!(path = %entry, "added trusted path");
        Ok(())
    }
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    let mut perms = meta.permissions();
    if perms.mode() & 0o111 != 0o111 {
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

fn copy_dir_all(src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let to = dst.join(entry.file_name());
        if ty.is_symlink() {
            continue;
        }
        if ty.is_dir() {
            copy_dir_all(&entry.path(), &to)?;
        } else {
            std::fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

fn normalize_rel_path(rel: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(rel);
    if p.is_absolute() {
        anyhow::bail!("path must be relative");
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => anyhow::bail!("path traversal is not allowed"),
            Component::Prefix(_) | Component::RootDir => anyhow::bail!("path must be relative"),
        }
    }
    Ok(out)
}

fn extract_zip_safely<R: Read + Seek>(reader: R, out_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    let mut archive = zip::ZipArchive::new(reader)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed)
            .map_err(|e| anyhow::anyhow!("invalid zip path {trimmed:?}: {e}"))?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let out_path = out_dir.join(&rel);
        if name.ends_with('/') {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = out_path.with_extension("tmp");
        let mut out = std::fs::File::create(&tmp_path)?;
        std::io::copy(&mut file, &mut out)?;
        out.sync_all().ok();
        std::fs::rename(&tmp_path, &out_path)?;
    }

    Ok(())
}
