//! The effect vocabulary every other module is written in.
//!
//! A handler is a suspended computation: a boxed [`Future`] that does nothing
//! until it is polled. Sequencing is `.await`, error propagation is `?` over
//! `Result`, and concurrency is whatever executor polls the futures (tokio in
//! [`Server`](crate::Server)). Two capabilities are not covered by the
//! language itself and live here:
//!
//! - **timers**: the [`Timer`] trait, so time-bounded operations (drain
//!   deadlines, the `timeout` middleware) do not hard-code a runtime clock;
//! - **scoped acquire/release**: [`bracket`], which runs a release step
//!   after the body whether the body returns, fails or panics.
//!
//! [`concurrently`] runs independent computations side by side on the
//! current task.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{self, Either};

/// A heap-allocated, type-erased future.
///
/// `Send` so tokio can move it across worker threads; handlers return
/// `BoxFuture<'static, Outcome>` so they can outlive the borrow of `self`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boxed, thread-safe error used at resource and codec seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Source of suspended waits.
pub trait Timer: Send + Sync + 'static {
    /// Resolves once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// [`Timer`] backed by the tokio clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Runs `fut` until it completes or `limit` elapses on `timer`.
///
/// Returns `None` on expiry; the unfinished future is dropped.
pub async fn with_deadline<F>(timer: &dyn Timer, limit: Duration, fut: F) -> Option<F::Output>
where
    F: Future,
{
    let fut = std::pin::pin!(fut);
    match future::select(fut, timer.sleep(limit)).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(((), _)) => None,
    }
}

/// Whole milliseconds in `duration` for log fields, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Polls every future in `futs` concurrently; outputs keep input order.
pub async fn concurrently<I>(futs: I) -> Vec<<I::Item as Future>::Output>
where
    I: IntoIterator,
    I::Item: Future,
{
    future::join_all(futs).await
}

/// Acquire a resource, use it, then release it.
///
/// `release` runs after `body` regardless of how `body` ends. A panic inside
/// `body` is held until the release step has finished and then resumed.
/// When `acquire` fails nothing was obtained, so nothing is released.
///
/// The resource is handed to both steps, hence `R: Clone` (usually an `Arc`).
pub async fn bracket<R, T, U, E, A, B, BF, L, LF>(acquire: A, body: B, release: L) -> Result<(T, U), E>
where
    R: Clone,
    A: Future<Output = Result<R, E>>,
    B: FnOnce(R) -> BF,
    BF: Future<Output = T>,
    L: FnOnce(R) -> LF,
    LF: Future<Output = U>,
{
    let resource = acquire.await?;
    let used: Result<T, Box<dyn Any + Send>> =
        AssertUnwindSafe(body(resource.clone())).catch_unwind().await;
    let released = release(resource).await;
    match used {
        Ok(value) => Ok((value, released)),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
