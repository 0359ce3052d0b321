use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ReleaseToken, Resource};
use crate::effect::{BoxError, BoxFuture, Timer};

/// Background job runner and clock.
///
/// Jobs registered with [`every`](Scheduler::every) run until the scheduler is
/// released; release cancels them and waits for the current tick of each to
/// finish.
#[derive(Default)]
pub struct Scheduler {
    token: CancellationToken,
    jobs: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` every `period`, first tick immediately.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            warn!(job = name, "scheduler released; job not started");
            return;
        }
        let token = self.token.child_token();
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticks.tick() => job().await,
                }
            }
            debug!(job = name, "job stopped");
        });
        info!(job = name, ?period, "job scheduled");
    }

    pub fn jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Timer for Scheduler {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

impl Resource for Scheduler {
    fn release(&self, _token: ReleaseToken) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            self.token.cancel();
            let mut jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner));
            let mut failed = 0usize;
            while let Some(joined) = jobs.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "scheduled job ended abnormally");
                    failed += 1;
                }
            }
            if failed > 0 {
                return Err(format!("{failed} scheduled job(s) panicked").into());
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_release_stops_jobs() {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        scheduler.every("count", Duration::from_millis(5), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.release(ReleaseToken(())).await.unwrap();
        assert_eq!(scheduler.jobs(), 0);

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_bounds_work_as_a_timer() {
        let scheduler = Scheduler::new();
        let late = crate::effect::with_deadline(&scheduler, Duration::from_millis(10), std::future::pending::<()>()).await;
        assert!(late.is_none());
    }

    #[tokio::test]
    async fn test_jobs_after_release_are_ignored() {
        let scheduler = Scheduler::new();
        scheduler.release(ReleaseToken(())).await.unwrap();
        scheduler.every("late", Duration::from_millis(5), || async {});
        assert_eq!(scheduler.jobs(), 0);
    }
}
