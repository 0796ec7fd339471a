use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use renter_fs::{FsError, FsResult};

struct TgInner {
    stop_tx: watch::Sender<bool>,
    active: AtomicUsize,
    drained: Notify,
}

/// Tracks every spawned task of the renter and carries the shared stop
/// signal. `stop` flips the signal and waits for the in-flight tasks to
/// drain; long loops observe the signal at least once per child
/// iteration.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<TgInner>,
}

impl TaskGroup {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TgInner {
                stop_tx,
                active: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Spawns `fut` as a tracked task. Fails with `Cancelled` once the
    /// group is stopping.
    pub fn launch<F>(&self, fut: F) -> FsResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return Err(FsError::Cancelled);
        }
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            fut.await;
            if inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.drained.notify_waiters();
            }
        });
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    /// A receiver resolving when the stop signal flips.
    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Signals stop and waits until every tracked task has finished.
    pub async fn stop(&self) {
        let _ = self.inner.stop_tx.send_replace(true);
        loop {
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            let drained = self.inner.drained.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_stop_waits_for_tasks() {
        let tg = TaskGroup::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            tg.launch(async move {
                sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        tg.stop().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(tg.active_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_after_stop_is_cancelled() {
        let tg = TaskGroup::new();
        tg.stop().await;
        assert!(matches!(tg.launch(async {}), Err(FsError::Cancelled)));
    }
}
