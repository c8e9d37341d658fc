use crate::error::GcError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Reclaim;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcPolicy {
    /// Pause between passes once a pass finds nothing to reclaim.
    pub interval: Duration,
    /// Fraction of a segment that must be reclaimable before it is rewritten.
    pub discard_ratio: f64,
}

/// Background reclamation loop. Failures are logged and retried on the next
/// tick; they never reach request handlers.
pub struct GcCoordinator {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl GcCoordinator {
    pub fn start(target: Arc<dyn Reclaim>, policy: GcPolicy) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(target, policy, cancel.clone()));
        Self { cancel, task }
    }

    /// True once the loop has exited, either through `stop` or because the
    /// store was closed underneath it.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Reclamation task panicked: {}", e);
        }
    }
}

async fn run(target: Arc<dyn Reclaim>, policy: GcPolicy, cancel: CancellationToken) {
    info!(
        interval = ?policy.interval,
        discard_ratio = policy.discard_ratio,
        "Starting value reclamation loop"
    );

    while !cancel.is_cancelled() {
        match target.reclaim(policy.discard_ratio).await {
            Ok(stats) => {
                // More segments may qualify; go again without waiting.
                debug!(entries = stats.entries, bytes = stats.bytes, "Reclaimed space");
                continue;
            }
            Err(GcError::NothingToReclaim) => {}
            Err(GcError::Closed) => {
                info!("Profile store closed, stopping value reclamation loop");
                return;
            }
            Err(e) => error!("Failed to run value reclamation: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(policy.interval) => {}
        }
    }
    info!("Value reclamation loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::ReclaimStats;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Replays scripted results, then reports nothing to reclaim forever.
    struct ScriptedReclaim {
        script: Mutex<VecDeque<Result<ReclaimStats, GcError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedReclaim {
        fn new(script: Vec<Result<ReclaimStats, GcError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reclaim for ScriptedReclaim {
        async fn reclaim(&self, _discard_ratio: f64) -> Result<ReclaimStats, GcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(GcError::NothingToReclaim))
        }
    }

    struct ErrorCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn policy() -> GcPolicy {
        GcPolicy {
            interval: Duration::from_secs(60),
            discard_ratio: 0.5,
        }
    }

    async fn wait_until_finished(gc: &GcCoordinator) {
        for _ in 0..100 {
            if gc.is_finished() {
                return;
            }
            time::sleep(Duration::from_secs(30)).await;
        }
        panic!("reclamation loop did not exit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_to_reclaim_keeps_looping_without_errors() {
        let errors = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter(errors.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let target = ScriptedReclaim::new(vec![
            Err(GcError::NothingToReclaim),
            Err(GcError::NothingToReclaim),
            Err(GcError::NothingToReclaim),
            Err(GcError::Closed),
        ]);
        let gc = GcCoordinator::start(target.clone(), policy());
        wait_until_finished(&gc).await;

        assert_eq!(target.calls(), 4);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_errors_are_logged_and_retried() {
        let errors = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter(errors.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let target = ScriptedReclaim::new(vec![
            Err(GcError::Backend(StorageError::WriteFailed("disk full".to_string()))),
            Ok(ReclaimStats { entries: 3, bytes: 30 }),
            Err(GcError::NothingToReclaim),
            Err(GcError::Closed),
        ]);
        let gc = GcCoordinator::start(target.clone(), policy());
        wait_until_finished(&gc).await;

        assert_eq!(target.calls(), 4);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_pass_runs_again_immediately() {
        let target = ScriptedReclaim::new(vec![
            Ok(ReclaimStats { entries: 1, bytes: 1 }),
            Ok(ReclaimStats { entries: 1, bytes: 1 }),
        ]);
        let gc = GcCoordinator::start(target.clone(), policy());

        // Less than one interval: only the back-to-back passes have run.
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(target.calls(), 3);

        gc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_sleep() {
        let target = ScriptedReclaim::new(vec![]);
        let gc = GcCoordinator::start(target.clone(), policy());
        time::sleep(Duration::from_secs(1)).await;

        gc.stop().await;
        assert_eq!(target.calls(), 1);
    }
}
