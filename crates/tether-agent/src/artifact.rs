use std::sync::Mutex;

use tether_interop::CompiledArtifact;

type ReleaseHook = Box<dyn FnOnce(&CompiledArtifact) + Send>;

/// A claim on a deployed build. Whoever manages deployments learns through the
/// release hook when the session stops using it.
pub struct ArtifactLease {
    artifact: CompiledArtifact,
    on_release: Mutex<Option<ReleaseHook>>,
}

impl std::fmt::Debug for ArtifactLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactLease")
            .field("artifact", &self.artifact)
            .finish_non_exhaustive()
    }
}

impl ArtifactLease {
    pub fn new(artifact: CompiledArtifact) -> Self {
        Self {
            artifact,
            on_release: Mutex::new(None),
        }
    }

    pub fn with_release_hook(
        artifact: CompiledArtifact,
        hook: impl FnOnce(&CompiledArtifact) + Send + 'static,
    ) -> Self {
        Self {
            artifact,
            on_release: Mutex::new(Some(Box::new(hook))),
        }
    }

    pub fn artifact(&self) -> &CompiledArtifact {
        &self.artifact
    }

    /// Runs the release hook at most once.
    pub fn dispose(&self) {
        let hook = self
            .on_release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            tracing::debug!(compile_job_id = self.artifact.compile_job_id, "artifact released");
            hook(&self.artifact);
        }
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use tether_interop::{DottedVersion, EngineKind, EngineVersion};

    use super::*;

    #[test]
    fn release_hook_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let artifact = CompiledArtifact {
            compile_job_id: 9,
            directory: PathBuf::from("/srv/game/9"),
            artifact_name: "world.dmb".to_string(),
            engine_version: EngineVersion::new(EngineKind::Byond, DottedVersion::new(515, 1633)),
        };
        let lease = {
            let calls = calls.clone();
            ArtifactLease::with_release_hook(artifact, move |a| {
                assert_eq!(a.compile_job_id, 9);
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        lease.dispose();
        lease.dispose();
        drop(lease);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
