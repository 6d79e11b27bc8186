use tokio::sync::watch;

/// Broadcast of a recurring event (reboots, active version changes).
///
/// A listener observes every firing that happens after it was created and never
/// one that happened before. Firings that land while a listener is not polling
/// are coalesced to the latest value.
#[derive(Debug)]
pub struct EventSignal<T> {
    tx: watch::Sender<(u64, Option<T>)>,
}

impl<T: Clone> Default for EventSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> EventSignal<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel((0, None));
        Self { tx }
    }

    pub fn fire(&self, value: T) {
        self.tx.send_modify(|(generation, current)| {
            *generation = generation.wrapping_add(1);
            *current = Some(value);
        });
    }

    pub fn listener(&self) -> EventListener<T> {
        EventListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.tx.borrow().0
    }
}

#[derive(Debug)]
pub struct EventListener<T> {
    rx: watch::Receiver<(u64, Option<T>)>,
}

impl<T: Clone> EventListener<T> {
    /// `None` once the signal itself is gone.
    pub async fn wait(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().1.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn every_registered_listener_sees_the_firing() {
        let signal = EventSignal::<u32>::new();
        let mut a = signal.listener();
        let mut b = signal.listener();
        signal.fire(7);
        assert_eq!(a.wait().await, Some(7));
        assert_eq!(b.wait().await, Some(7));
    }

    #[tokio::test]
    async fn late_listener_does_not_see_old_firing() {
        let signal = EventSignal::<u32>::new();
        signal.fire(1);
        let mut late = signal.listener();
        let waited = tokio::time::timeout(Duration::from_millis(50), late.wait()).await;
        assert!(waited.is_err(), "late listener must not observe a past firing");

        signal.fire(2);
        assert_eq!(late.wait().await, Some(2));
        assert_eq!(signal.generation(), 2);
    }

    #[tokio::test]
    async fn dropped_signal_ends_waits() {
        let signal = EventSignal::<u32>::new();
        let mut listener = signal.listener();
        drop(signal);
        assert_eq!(listener.wait().await, None);
    }
}
