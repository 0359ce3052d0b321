//! Middleware: handler-to-handler transformers and their ordered pipeline.
//!
//! A [`Middleware`] takes the handler it wraps and returns a new handler.
//! A [`Pipeline`] is an ordered list of them, folded once at startup into a
//! single handler. The **first** middleware in the list is the **outermost**:
//! it sees the request first and the outcome last.
//!
//! ```text
//! Pipeline [m1, m2] applied to h   ==   m1(m2(h))
//!
//! request ─▶ m1 ─▶ m2 ─▶ h
//! outcome ◀─ m1 ◀─ m2 ◀─ h
//! ```
//!
//! Middleware may rewrite a response or a failure, but never turns a failure
//! into `NotHandled`: the pipeline remembers each layer's inner failure and
//! restores it if the layer declines afterwards.
//!
//! Built-in middleware:
//! - [`trace()`]: per-request span with method, path, outcome, status, latency
//! - [`request_id()`]: propagates or generates `x-request-id`
//! - [`set_header()`]: appends a fixed header to handled responses
//! - [`timeout()`]: fails requests that outlive a deadline

mod headers;
mod request_id;
mod timeout;
mod trace;

pub use headers::set_header;
pub use request_id::{REQUEST_ID_HEADER, request_id};
pub use timeout::timeout;
pub use trace::trace;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::MiddlewareConfig;
use crate::effect::{BoxFuture, Timer};
use crate::error::DispatchError;
use crate::handler::{BoxedHandler, ErasedHandler, Handler, IntoOutcome, Outcome};
use crate::request::Request;

/// A handler-to-handler transformer.
///
/// Implemented for any `Fn(BoxedHandler) -> BoxedHandler`; use [`from_fn`]
/// for the common "do something around `next`" shape.
///
/// Pass the request you received (or a copy derived from it) to the inner
/// handler: the pipeline's failure guard rides on it. A layer that builds a
/// brand new request from raw parts loses the guard, and may then turn the
/// inner handler's failure into `NotHandled`.
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler;

    /// Label used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Middleware for F
where
    F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
{
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
        self(inner)
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Ordered middleware list. Order is fixed at construction.
#[derive(Clone, Default)]
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `middleware` inside every layer added so far.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Concatenates `inner` after `self`; `self`'s layers stay outermost.
    pub fn then(mut self, inner: Pipeline) -> Self {
        self.layers.extend(inner.layers);
        self
    }

    pub fn len(&self) -> usize { self.layers.len() }
    pub fn is_empty(&self) -> bool { self.layers.is_empty() }

    /// Layer names, outermost first.
    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|m| m.name()).collect()
    }

    /// Wraps `handler` in every layer. An empty pipeline returns it as is.
    pub fn apply(&self, handler: impl Handler) -> BoxedHandler {
        self.layers.iter().rev().fold(handler.into_boxed_handler(), |inner, layer| {
            let recorded = BoxedHandler::new(Recorded(inner));
            BoxedHandler::new(Guarded {
                layer: layer.wrap(recorded),
                name: layer.name().to_owned(),
            })
        })
    }

    /// Builds a pipeline from configuration, preserving order.
    pub fn from_config(entries: &[MiddlewareConfig], timer: Arc<dyn Timer>) -> Self {
        entries.iter().fold(Self::new(), |pipeline, entry| match entry {
            MiddlewareConfig::Trace => pipeline.layer(trace()),
            MiddlewareConfig::RequestId => pipeline.layer(request_id()),
            MiddlewareConfig::SetHeader { name, value } => {
                pipeline.layer(set_header(name.clone(), value.clone()))
            }
            MiddlewareConfig::Timeout { ms } => {
                pipeline.layer(timeout(Arc::clone(&timer), Duration::from_millis(*ms)))
            }
        })
    }
}

// ── Failure guard ─────────────────────────────────────────────────────────────

/// Where a layer's inner failure is noted for the guard outside it.
///
/// Travels on the request, so it survives a layer that runs the rest of the
/// pipeline on another task.
pub(crate) type FailureSlot = Arc<Mutex<Option<DispatchError>>>;

/// Sits between a layer and the handler it wraps; notes failures.
struct Recorded(BoxedHandler);

impl ErasedHandler for Recorded {
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        let slot = req.failure_slot().cloned();
        let fut = self.0.call(req);
        Box::pin(async move {
            let outcome = fut.await;
            if let Outcome::Failed(err) = &outcome {
                match &slot {
                    Some(slot) => *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.clone()),
                    None => debug!(error = %err, "request reached the inner handler without a failure slot"),
                }
            }
            outcome
        })
    }
}

/// Sits outside a layer; restores a failure the layer tried to decline.
struct Guarded {
    layer: BoxedHandler,
    name: String,
}

impl ErasedHandler for Guarded {
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        let slot = FailureSlot::default();
        let fut = self.layer.call(req.with_failure_slot(Arc::clone(&slot)));
        let name = self.name.clone();
        Box::pin(async move {
            let outcome = fut.await;
            if outcome.is_not_handled() {
                if let Some(err) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    warn!(middleware = %name, error = %err, "middleware declined a failed request; keeping the failure");
                    return Outcome::Failed(err);
                }
            }
            outcome
        })
    }
}

// ── from_fn ───────────────────────────────────────────────────────────────────

/// The rest of the pipeline, handed to a [`from_fn`] middleware.
#[derive(Clone)]
pub struct Next {
    inner: BoxedHandler,
}

impl Next {
    /// Runs the wrapped handler.
    pub async fn run(self, req: Request) -> Outcome {
        self.inner.call(req).await
    }
}

/// Builds a middleware from an async function of the request and [`Next`].
///
/// ```rust
/// use tessera::middleware::{Next, from_fn};
/// use tessera::Request;
///
/// let mw = from_fn(|req: Request, next: Next| async move {
///     tracing::debug!(path = req.path(), "before");
///     next.run(req).await
/// });
/// ```
pub fn from_fn<F, Fut, O>(f: F) -> FromFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: IntoOutcome + Send + 'static,
{
    FromFn { f: Arc::new(f), name: "from_fn" }
}

pub struct FromFn<F> {
    f: Arc<F>,
    name: &'static str,
}

impl<F> FromFn<F> {
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl<F, Fut, O> Middleware for FromFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: IntoOutcome + Send + 'static,
{
    fn wrap(&self, inner: BoxedHandler) -> BoxedHandler {
        BoxedHandler::new(FromFnHandler { f: Arc::clone(&self.f), inner })
    }

    fn name(&self) -> &str {
        self.name
    }
}

struct FromFnHandler<F> {
    f: Arc<F>,
    inner: BoxedHandler,
}

impl<F, Fut, O> ErasedHandler for FromFnHandler<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: IntoOutcome + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        let fut = (self.f)(req, Next { inner: self.inner.clone() });
        Box::pin(async move { fut.await.into_outcome() })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::effect::TokioTimer;
    use crate::error::HandlerError;
    use crate::response::Response;

    fn req() -> Request {
        http::Request::get("/").body(Bytes::new()).unwrap().into()
    }

    async fn ok(_req: Request) -> Response {
        Response::text("ok")
    }

    async fn broken(_req: Request) -> Result<Response, HandlerError> {
        Err(HandlerError::new("broken"))
    }

    fn header_names(outcome: Outcome) -> Vec<String> {
        match outcome {
            Outcome::Handled(res) => res.headers().iter().map(|(k, _)| k.clone()).collect(),
            other => panic!("expected handled, got {other:?}"),
        }
    }

    fn entering(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> impl Middleware {
        let log = Arc::clone(log);
        from_fn(move |req: Request, next: Next| {
            log.lock().unwrap().push(label);
            next.run(req)
        })
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_identity() {
        let bare = (ok).into_boxed_handler();
        let wrapped = Pipeline::new().apply(ok);

        let a = header_names(bare.call(req()).await);
        let b = header_names(wrapped.call(req()).await);
        assert_eq!(a, b);

        assert!(Pipeline::new().apply(broken).call(req()).await.is_failed());
        assert!(Pipeline::new().apply(crate::handler::not_handled()).call(req()).await.is_not_handled());
    }

    #[tokio::test]
    async fn test_order_decides_header_position() {
        let m1_m2 = Pipeline::new()
            .layer(set_header("x", "1"))
            .layer(set_header("y", "2"))
            .apply(ok);
        let m2_m1 = Pipeline::new()
            .layer(set_header("y", "2"))
            .layer(set_header("x", "1"))
            .apply(ok);

        // The outermost layer appends last.
        assert_eq!(header_names(m1_m2.call(req()).await), ["content-type", "y", "x"]);
        assert_eq!(header_names(m2_m1.call(req()).await), ["content-type", "x", "y"]);
    }

    #[tokio::test]
    async fn test_first_layer_sees_request_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = Pipeline::new()
            .layer(entering(&log, "outer"))
            .layer(entering(&log, "inner"))
            .apply(ok);

        app.call(req()).await;
        assert_eq!(*log.lock().unwrap(), ["outer", "inner"]);
    }

    #[tokio::test]
    async fn test_then_keeps_outer_layers_outside() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer = Pipeline::new().layer(entering(&log, "a"));
        let inner = Pipeline::new().layer(entering(&log, "b")).layer(entering(&log, "c"));

        outer.then(inner).apply(ok).call(req()).await;
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_middleware_may_answer_without_next() {
        let short = from_fn(|_req: Request, _next: Next| async { StatusCode::TOO_MANY_REQUESTS });
        let outcome = Pipeline::new().layer(short).apply(ok).call(req()).await;

        assert!(matches!(outcome, Outcome::Handled(ref r) if r.status_code() == StatusCode::TOO_MANY_REQUESTS));
    }

    #[tokio::test]
    async fn test_failure_cannot_become_not_handled() {
        let swallow = from_fn(|req: Request, next: Next| async move {
            match next.run(req).await {
                Outcome::Failed(_) => Outcome::NotHandled,
                other => other,
            }
        });
        let app = Pipeline::new()
            .layer(set_header("x", "1"))
            .layer(swallow)
            .apply(broken);

        let outcome = app.call(req()).await;
        assert!(matches!(outcome, Outcome::Failed(DispatchError::Handler(ref e)) if e.message() == "broken"));
    }

    #[tokio::test]
    async fn test_failure_survives_layer_running_next_on_another_task() {
        let detached = from_fn(|req: Request, next: Next| async move {
            match tokio::spawn(next.run(req)).await {
                Ok(Outcome::Failed(_)) | Err(_) => Outcome::NotHandled,
                Ok(other) => other,
            }
        });
        let app = Pipeline::new().layer(detached).layer(set_header("x", "1")).apply(broken);

        let outcome = app.call(req()).await;
        assert!(matches!(outcome, Outcome::Failed(DispatchError::Handler(ref e)) if e.message() == "broken"));
    }

    #[tokio::test]
    async fn test_genuine_not_handled_passes_through() {
        let app = Pipeline::new().layer(set_header("x", "1")).apply(crate::handler::not_handled());
        assert!(app.call(req()).await.is_not_handled());
    }

    #[tokio::test]
    async fn test_failure_may_be_rewritten_into_response() {
        let recover = from_fn(|req: Request, next: Next| async move {
            match next.run(req).await {
                Outcome::Failed(_) => Outcome::Handled(Response::status(StatusCode::SERVICE_UNAVAILABLE)),
                other => other,
            }
        });
        let outcome = Pipeline::new().layer(recover).apply(broken).call(req()).await;
        assert!(outcome.is_handled());
    }

    #[test]
    fn test_from_config_preserves_order() {
        let entries = vec![
            MiddlewareConfig::RequestId,
            MiddlewareConfig::Trace,
            MiddlewareConfig::SetHeader { name: "x".into(), value: "1".into() },
            MiddlewareConfig::Timeout { ms: 50 },
        ];
        let pipeline = Pipeline::from_config(&entries, Arc::new(TokioTimer));
        assert_eq!(pipeline.names(), ["request_id", "trace", "set_header", "timeout"]);
    }
}
