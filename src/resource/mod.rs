//! Shared infrastructure with a single acquire/release lifecycle.
//!
//! The [`ResourceManager`] constructs each resource once, hands out shared
//! read-only references (`Arc<T>`) to whoever builds handlers, and is the only
//! party able to release them. Releasing happens once, in strict reverse
//! order of acquisition:
//!
//! ```text
//! acquire R1 ─▶ acquire R2 ─▶ acquire R3 ─▶ … serve … ─▶ release R3 ─▶ release R2 ─▶ release R1
//! ```
//!
//! A failing (or panicking) release is recorded and the remaining releases
//! still run. Acquire and release never overlap: both hold the manager's
//! lifecycle lock, and once released the manager refuses new acquisitions.

mod client;
mod scheduler;
mod topic;

pub use client::{ClientError, HttpClient};
pub use scheduler::Scheduler;
pub use topic::{Topic, TopicClosed};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::effect::{BoxError, BoxFuture};
use crate::error::{AcquisitionError, ReleaseError, ReleaseErrors};

/// Proof that the caller is the [`ResourceManager`].
///
/// Cannot be constructed outside this crate, so only the manager can call
/// [`Resource::release`].
pub struct ReleaseToken(());

/// A shared, expensive-to-construct dependency.
///
/// Resources are used through `&self` from many requests at once, so
/// implementors must be internally thread-safe.
pub trait Resource: Send + Sync + 'static {
    /// Tears the resource down. Called exactly once, by the manager.
    fn release(&self, _token: ReleaseToken) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(std::future::ready(Ok(())))
    }
}

struct Entry {
    name: String,
    resource: Arc<dyn Resource>,
}

#[derive(Default)]
struct Lifecycle {
    acquired: Vec<Entry>,
    released: bool,
}

/// Owner of every shared resource in the process.
///
/// Handlers may hold the manager itself, but releasing stays with the server:
///
/// ```compile_fail
/// async fn early(resources: std::sync::Arc<tessera::ResourceManager>) {
///     let _ = resources.release_all().await;
/// }
/// ```
#[derive(Default)]
pub struct ResourceManager {
    lifecycle: Mutex<Lifecycle>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `factory` and registers its result under `name`.
    ///
    /// The returned `Arc` may be cloned into any number of handlers; none of
    /// them can release it.
    pub async fn acquire<T, F, Fut, E>(&self, name: &str, factory: F) -> Result<Arc<T>, AcquisitionError>
    where
        T: Resource,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.released {
            return Err(AcquisitionError {
                name: name.to_owned(),
                source: "resource manager already released".into(),
            });
        }

        let constructing = AssertUnwindSafe(async move { factory().await }).catch_unwind();
        let source: BoxError = match constructing.await {
            Ok(Ok(resource)) => {
                let resource = Arc::new(resource);
                lifecycle.acquired.push(Entry {
                    name: name.to_owned(),
                    resource: Arc::clone(&resource) as Arc<dyn Resource>,
                });
                info!(resource = name, position = lifecycle.acquired.len(), "resource acquired");
                return Ok(resource);
            }
            Ok(Err(e)) => e.into(),
            Err(_panic) => "resource factory panicked".into(),
        };
        error!(resource = name, error = %source, "resource acquisition failed");
        Err(AcquisitionError { name: name.to_owned(), source })
    }

    /// Releases every acquired resource, last acquired first.
    ///
    /// Every release is attempted; failures are collected and returned
    /// together. Calling this again is a no-op. Only the server calls this,
    /// once its drain is over or startup has failed.
    pub(crate) async fn release_all(&self) -> Result<(), ReleaseErrors> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.released {
            warn!("release_all called more than once; ignoring");
            return Ok(());
        }
        lifecycle.released = true;

        let mut failures = Vec::new();
        while let Some(Entry { name, resource }) = lifecycle.acquired.pop() {
            let releasing = AssertUnwindSafe(resource.release(ReleaseToken(()))).catch_unwind();
            let source: BoxError = match releasing.await {
                Ok(Ok(())) => {
                    info!(resource = %name, "resource released");
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_panic) => "release panicked".into(),
            };
            error!(resource = %name, error = %source, "resource release failed");
            failures.push(ReleaseError { name, source });
        }

        debug!(failed = failures.len(), "release pass complete");
        if failures.is_empty() { Ok(()) } else { Err(ReleaseErrors(failures)) }
    }

    /// Names of the resources currently held, in acquisition order.
    pub async fn held(&self) -> Vec<String> {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle.acquired.iter().map(|e| e.name.clone()).collect()
    }

    pub async fn is_released(&self) -> bool {
        self.lifecycle.lock().await.released
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    type Log = Arc<StdMutex<Vec<String>>>;

    #[derive(Debug)]
    enum Mode {
        Ok,
        Fail,
        Panic,
    }

    #[derive(Debug)]
    struct Stub {
        name: &'static str,
        mode: Mode,
        log: Log,
    }

    impl Resource for Stub {
        fn release(&self, _token: ReleaseToken) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(self.name.to_owned());
                match self.mode {
                    Mode::Ok => Ok(()),
                    Mode::Fail => Err(format!("{} refused to close", self.name).into()),
                    Mode::Panic => panic!("{} exploded", self.name),
                }
            })
        }
    }

    async fn stub(mgr: &ResourceManager, log: &Log, name: &'static str, mode: Mode) -> Arc<Stub> {
        let log = Arc::clone(log);
        mgr.acquire(name, || async move { Ok::<_, BoxError>(Stub { name, mode, log }) })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_release_in_reverse_order() {
        let mgr = ResourceManager::new();
        let log = Log::default();
        stub(&mgr, &log, "r1", Mode::Ok).await;
        stub(&mgr, &log, "r2", Mode::Ok).await;
        stub(&mgr, &log, "r3", Mode::Ok).await;

        assert_eq!(mgr.held().await, ["r1", "r2", "r3"]);
        mgr.release_all().await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["r3", "r2", "r1"]);
        assert!(mgr.held().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_release_does_not_stop_the_rest() {
        let mgr = ResourceManager::new();
        let log = Log::default();
        stub(&mgr, &log, "r1", Mode::Ok).await;
        stub(&mgr, &log, "r2", Mode::Fail).await;
        stub(&mgr, &log, "r3", Mode::Ok).await;

        let errs = mgr.release_all().await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), ["r3", "r2", "r1"]);
        assert_eq!(errs.0.len(), 1);
        assert_eq!(errs.0[0].name, "r2");
    }

    #[tokio::test]
    async fn test_panicking_release_is_collected() {
        let mgr = ResourceManager::new();
        let log = Log::default();
        stub(&mgr, &log, "r1", Mode::Ok).await;
        stub(&mgr, &log, "r2", Mode::Panic).await;
        stub(&mgr, &log, "r3", Mode::Fail).await;

        let errs = mgr.release_all().await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), ["r3", "r2", "r1"]);
        let names: Vec<&str> = errs.0.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["r3", "r2"]);
    }

    #[tokio::test]
    async fn test_release_all_runs_once() {
        let mgr = ResourceManager::new();
        let log = Log::default();
        stub(&mgr, &log, "r1", Mode::Ok).await;

        mgr.release_all().await.unwrap();
        mgr.release_all().await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(mgr.is_released().await);
    }

    #[tokio::test]
    async fn test_acquire_after_release_is_refused() {
        let mgr = ResourceManager::new();
        mgr.release_all().await.unwrap();

        let log = Log::default();
        let err = mgr
            .acquire("late", || async move {
                Ok::<_, BoxError>(Stub { name: "late", mode: Mode::Ok, log })
            })
            .await
            .unwrap_err();
        assert_eq!(err.name, "late");
    }

    #[tokio::test]
    async fn test_failed_factory_is_not_registered() {
        let mgr = ResourceManager::new();
        let log = Log::default();
        stub(&mgr, &log, "r1", Mode::Ok).await;

        let err = mgr
            .acquire::<Stub, _, _, _>("r2", || async { Err("no capacity") })
            .await
            .unwrap_err();
        assert_eq!(err.name, "r2");
        assert_eq!(mgr.held().await, ["r1"]);
    }

    async fn exploding() -> Result<Stub, BoxError> {
        panic!("factory exploded")
    }

    #[tokio::test]
    async fn test_panicking_factory_is_an_acquisition_failure() {
        let mgr = ResourceManager::new();
        let log = Log::default();
        stub(&mgr, &log, "r1", Mode::Ok).await;

        let err = mgr.acquire("r2", exploding).await.unwrap_err();
        assert_eq!(err.name, "r2");
        assert_eq!(mgr.held().await, ["r1"]);

        stub(&mgr, &log, "r3", Mode::Ok).await;
        mgr.release_all().await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["r3", "r1"]);
    }
}
