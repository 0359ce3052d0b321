//! Partial handlers and the three-way [`Outcome`].
//!
//! # Not found vs. failed
//!
//! A handler answers every request with exactly one of:
//!
//! ```text
//! NotHandled        "not my route"      → the Router tries the next handler
//! Handled(resp)     "mine, here it is"  → evaluation stops
//! Failed(err)       "mine, but broken"  → evaluation stops, error surfaces
//! ```
//!
//! Keeping *not found* apart from *failed* is what makes first-match-wins
//! combination safe: a failing handler still claims its request.
//!
//! # How handlers are stored
//!
//! Routers and middleware hold handlers of different concrete types, so every
//! handler is erased to a [`BoxedHandler`]:
//!
//! ```text
//! async fn hello(req: Request) -> Response { … }   ← user writes this
//!        ↓ router.route(hello)
//! hello.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! BoxedHandler(Arc::new(FnHandler(hello)))         ← one allocation at startup
//!        ↓
//! handler.call(req)  at request time               ← one vtable dispatch
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::effect::BoxFuture;
use crate::error::{DispatchError, HandlerError};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

// ── Outcome ───────────────────────────────────────────────────────────────────

/// Result of offering one request to one handler.
pub enum Outcome {
    NotHandled,
    Handled(Response),
    Failed(DispatchError),
}

impl Outcome {
    pub fn is_not_handled(&self) -> bool { matches!(self, Self::NotHandled) }
    pub fn is_handled(&self) -> bool { matches!(self, Self::Handled(_)) }
    pub fn is_failed(&self) -> bool { matches!(self, Self::Failed(_)) }

    /// Applies `f` to a handled response; other outcomes pass through.
    pub fn map_response(self, f: impl FnOnce(Response) -> Response) -> Self {
        match self {
            Self::Handled(res) => Self::Handled(f(res)),
            other => other,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotHandled => "not_handled",
            Self::Handled(_) => "handled",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotHandled => f.write_str("NotHandled"),
            Self::Handled(res) => f.debug_tuple("Handled").field(&res.status_code()).finish(),
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

/// Conversion of a handler's return value into an [`Outcome`].
///
/// Anything that converts into a [`Response`] counts as handled; a `Result`
/// whose error converts into a [`DispatchError`] counts as failed on `Err`.
/// Returning [`Outcome::NotHandled`] is the only way to decline a request.
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for Outcome {
    fn into_outcome(self) -> Outcome { self }
}

impl IntoOutcome for Response {
    fn into_outcome(self) -> Outcome { Outcome::Handled(self) }
}

impl IntoOutcome for &'static str {
    fn into_outcome(self) -> Outcome { Outcome::Handled(self.into_response()) }
}

impl IntoOutcome for String {
    fn into_outcome(self) -> Outcome { Outcome::Handled(self.into_response()) }
}

impl IntoOutcome for http::StatusCode {
    fn into_outcome(self) -> Outcome { Outcome::Handled(self.into_response()) }
}

impl IntoOutcome for HandlerError {
    fn into_outcome(self) -> Outcome { Outcome::Failed(self.into()) }
}

impl<R, E> IntoOutcome for Result<R, E>
where
    R: IntoResponse,
    E: Into<DispatchError>,
{
    fn into_outcome(self) -> Outcome {
        match self {
            Ok(r) => Outcome::Handled(r.into_response()),
            Err(e) => Outcome::Failed(e.into()),
        }
    }
}

// ── Erased handlers ───────────────────────────────────────────────────────────

/// Object-safe dispatch interface behind every [`BoxedHandler`].
///
/// Implement this for handler structs that keep their own state, then wrap
/// them with [`BoxedHandler::new`]. Plain `async fn`s never need it.
pub trait ErasedHandler: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome>;
}

/// A type-erased handler shared across concurrent requests.
///
/// Cloning is one atomic increment.
#[derive(Clone)]
pub struct BoxedHandler(Arc<dyn ErasedHandler>);

impl BoxedHandler {
    pub fn new(handler: impl ErasedHandler) -> Self {
        Self(Arc::new(handler))
    }

    /// Offers `req` to the handler.
    pub fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        self.0.call(req)
    }
}

impl fmt::Debug for BoxedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxedHandler")
    }
}

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for everything that can be mounted as a handler.
///
/// You never implement this yourself. It is satisfied by:
///
/// - any `async fn(Request) -> impl IntoOutcome` (or equivalent closure),
/// - [`BoxedHandler`], [`Router`](crate::Router), [`Routes`](crate::Routes)
///   and [`AuthenticatedRouter`](crate::AuthenticatedRouter).
///
/// The trait is **sealed** so the set of conversions stays closed; custom
/// handler structs go through [`ErasedHandler`] and [`BoxedHandler::new`].
pub trait Handler: private::Sealed + Send + Sync + 'static {
    fn into_boxed_handler(self) -> BoxedHandler;
}

pub(crate) mod private {
    pub trait Sealed {}
}

impl<F, Fut, O> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: IntoOutcome + Send + 'static,
{
}

impl<F, Fut, O> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        BoxedHandler::new(FnHandler(self))
    }
}

impl private::Sealed for BoxedHandler {}

impl Handler for BoxedHandler {
    fn into_boxed_handler(self) -> BoxedHandler { self }
}

/// Bridges a typed `Fn` to the erased interface.
struct FnHandler<F>(F);

impl<F, Fut, O> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: IntoOutcome + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_outcome() })
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

struct Decline;

impl ErasedHandler for Decline {
    fn call(&self, _req: Request) -> BoxFuture<'static, Outcome> {
        Box::pin(std::future::ready(Outcome::NotHandled))
    }
}

/// A handler that declines every request.
///
/// The identity element of [`combine`](crate::router::combine).
pub fn not_handled() -> BoxedHandler {
    BoxedHandler::new(Decline)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;

    use super::*;

    fn req() -> Request {
        http::Request::get("/").body(Bytes::new()).unwrap().into()
    }

    #[tokio::test]
    async fn test_async_fn_becomes_handler() {
        async fn hello(_req: Request) -> &'static str { "hello" }

        let outcome = hello.into_boxed_handler().call(req()).await;
        match outcome {
            Outcome::Handled(res) => assert_eq!(res.body().as_ref(), b"hello"),
            other => panic!("expected handled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_result_err_becomes_failed() {
        let h = (|_req: Request| async {
            Err::<Response, _>(HandlerError::new("db down"))
        })
        .into_boxed_handler();

        assert!(h.call(req()).await.is_failed());
    }

    #[tokio::test]
    async fn test_not_handled_declines() {
        assert!(not_handled().call(req()).await.is_not_handled());
    }

    #[test]
    fn test_map_response_only_touches_handled() {
        let mapped = Outcome::Handled(Response::text("a"))
            .map_response(|_| Response::status(StatusCode::ACCEPTED));
        assert!(matches!(mapped, Outcome::Handled(ref r) if r.status_code() == StatusCode::ACCEPTED));

        let untouched = Outcome::NotHandled.map_response(|_| unreachable!());
        assert!(untouched.is_not_handled());
    }
}
