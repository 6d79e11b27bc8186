use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tether_interop::EngineVersion;
use tokio::sync::{mpsc, watch};

use crate::engine_installation::EngineInstallation;

/// A shared value with a lease count whose "reached zero" moment any number of
/// waiters can observe.
#[derive(Debug)]
pub struct RefCounted<T> {
    value: Arc<T>,
    count: Arc<watch::Sender<usize>>,
}

impl<T> Clone for RefCounted<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            count: self.count.clone(),
        }
    }
}

impl<T> RefCounted<T> {
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(0usize);
        Self {
            value: Arc::new(value),
            count: Arc::new(tx),
        }
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub fn lease(&self) -> Lease<T> {
        self.count.send_modify(|c| *c += 1);
        Lease {
            value: self.value.clone(),
            count: self.count.clone(),
            released: false,
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    pub async fn wait_for_zero(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|c| *c == 0).await;
    }

    /// Same container, not merely an equal value.
    pub fn ptr_eq(&self, other: &RefCounted<T>) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

#[derive(Debug)]
pub struct Lease<T> {
    value: Arc<T>,
    count: Arc<watch::Sender<usize>>,
    released: bool,
}

impl<T> Lease<T> {
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// Returns true if this release brought the count to zero.
    pub fn release(&mut self) -> bool {
        if std::mem::replace(&mut self.released, true) {
            return false;
        }
        let mut now_zero = false;
        self.count.send_modify(|c| {
            *c = c.saturating_sub(1);
            now_zero = *c == 0;
        });
        now_zero
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Keeps one engine installation from being deleted while a session uses it.
#[derive(Debug)]
pub struct EngineExecutableLock {
    installation: Arc<EngineInstallation>,
    lease: Mutex<Option<Lease<EngineInstallation>>>,
    keep: AtomicBool,
    reaper: Option<mpsc::UnboundedSender<EngineVersion>>,
}

impl EngineExecutableLock {
    pub fn new(
        lease: Lease<EngineInstallation>,
        reaper: Option<mpsc::UnboundedSender<EngineVersion>>,
    ) -> Self {
        Self {
            installation: lease.value().clone(),
            lease: Mutex::new(Some(lease)),
            keep: AtomicBool::new(false),
            reaper,
        }
    }

    pub fn installation(&self) -> &EngineInstallation {
        &self.installation
    }

    pub fn version(&self) -> &EngineVersion {
        self.installation.version()
    }

    /// Opts this lease out of delete-on-detach for ephemeral installations.
    pub fn do_not_delete_this_session(&self) {
        self.keep.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.lease
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Releases the lease. Safe to call more than once.
    pub fn dispose(&self) {
        let lease = self.lease.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut lease) = lease else {
            return;
        };
        let last = lease.release();
        if last && self.installation.ephemeral() && !self.keep.load(Ordering::SeqCst) {
            if let Some(reaper) = &self.reaper {
                tracing::debug!(version = %self.version(), "last lease of ephemeral engine released");
                let _ = reaper.send(self.version().clone());
            }
        }
    }
}

impl Drop for EngineExecutableLock {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use tether_interop::{DottedVersion, EngineKind};

    use super::*;
    use crate::engine_installation::InstallStatus;

    fn version() -> EngineVersion {
        EngineVersion::new(EngineKind::Byond, DottedVersion::new(515, 1600))
    }

    #[tokio::test]
    async fn zero_is_observed_after_every_lease_is_gone() {
        let rc = RefCounted::new(5u32);
        let a = rc.lease();
        let mut b = rc.lease();
        assert_eq!(rc.count(), 2);

        let waiter = {
            let rc = rc.clone();
            tokio::spawn(async move { rc.wait_for_zero().await })
        };
        assert!(!b.release());
        assert!(!b.release(), "double release must not decrement twice");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap();
        assert_eq!(rc.count(), 0);
    }

    #[test]
    fn ptr_eq_distinguishes_containers() {
        let a = RefCounted::new(1u32);
        let b = RefCounted::new(1u32);
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn dispose_is_idempotent() {
        let rc = RefCounted::new(EngineInstallation::installed(version(), PathBuf::from("/e")));
        let lock = EngineExecutableLock::new(rc.lease(), None);
        let other = EngineExecutableLock::new(rc.lease(), None);
        lock.dispose();
        lock.dispose();
        assert!(lock.is_disposed());
        assert_eq!(rc.count(), 1);
        drop(other);
        assert_eq!(rc.count(), 0);
    }

    #[test]
    fn last_ephemeral_lease_notifies_reaper() {
        let (_status_tx, status_rx) = watch::channel(InstallStatus::Ready);
        let rc = RefCounted::new(EngineInstallation::new(
            version(),
            PathBuf::from("/e"),
            true,
            status_rx,
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let a = EngineExecutableLock::new(rc.lease(), Some(tx.clone()));
        let b = EngineExecutableLock::new(rc.lease(), Some(tx.clone()));
        a.dispose();
        assert!(rx.try_recv().is_err());
        b.dispose();
        assert_eq!(rx.try_recv().unwrap(), version());

        let kept = EngineExecutableLock::new(rc.lease(), Some(tx));
        kept.do_not_delete_this_session();
        kept.dispose();
        assert!(rx.try_recv().is_err());
    }
}
