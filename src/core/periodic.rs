use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A cancellable ticker loop.
///
/// One cycle runs at a time; a cycle already in flight when shutdown is
/// requested is allowed to finish, bounded by the shutdown timeout.
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        parent: &CancellationToken,
        cycle: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_inner(name, period, None, parent, cycle)
    }

    /// Like [`PeriodicTask::spawn`], but `trigger` also starts an
    /// out-of-band cycle without waiting for the next tick.
    pub fn spawn_with_trigger<F, Fut>(
        name: &'static str,
        period: Duration,
        trigger: Arc<Notify>,
        parent: &CancellationToken,
        cycle: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_inner(name, period, Some(trigger), parent, cycle)
    }

    fn spawn_inner<F, Fut>(
        name: &'static str,
        period: Duration,
        trigger: Option<Arc<Notify>>,
        parent: &CancellationToken,
        mut cycle: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            interval.tick().await;

            loop {
                let triggered = async {
                    match &trigger {
                        Some(notify) => notify.notified().await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = triggered => {
                        tracing::debug!("⚡ {} triggered out of band", name);
                    }
                }

                cycle().await;
            }

            tracing::debug!("⏹️  {} loop stopped", name);
        });

        tracing::debug!("⏱️  {} scheduled every {:?}", name, period);

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop accepting cycles and wait for the in-flight one.
    ///
    /// Returns `false` if the timeout elapsed and the loop had to be aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    "⚠️  {} did not stop within {:?}, aborting",
                    self.name,
                    timeout
                );
                handle.abort();
                false
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_runs_and_stops() {
        let parent = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let task = PeriodicTask::spawn("test", Duration::from_millis(10), &parent, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.shutdown(Duration::from_secs(1)).await);
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_trigger_runs_out_of_band() {
        let parent = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let task = PeriodicTask::spawn_with_trigger(
            "triggered",
            Duration::from_secs(3600),
            trigger.clone(),
            &parent,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(task.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_slow_cycle_is_aborted_after_timeout() {
        let parent = CancellationToken::new();
        let task = PeriodicTask::spawn("slow", Duration::from_millis(5), &parent, || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.shutdown(Duration::from_millis(50)).await);
    }
}
