//! First-match-wins combination of partial handlers.
//!
//! A [`Router`] knows nothing about paths. It holds an ordered list of
//! handlers and offers each request to them in order until one of them
//! does something other than decline:
//!
//! ```text
//! request ─▶ h0 ──NotHandled──▶ h1 ──NotHandled──▶ h2 ──NotHandled──▶ NotHandled
//!             │                  │                  │
//!             └─Handled/Failed───┴──────────────────┴──▶ that outcome (later handlers never run)
//! ```
//!
//! Combination is associative and [`not_handled`](crate::not_handled) is its
//! identity, so routers nest freely.

use std::sync::Arc;

use tracing::trace;

use crate::effect::BoxFuture;
use crate::handler::{BoxedHandler, ErasedHandler, Handler, Outcome, private};
use crate::request::Request;

/// Ordered, immutable-after-build list of handlers.
///
/// Each [`Router::route`] call returns `self` so registrations chain.
#[derive(Clone, Default)]
pub struct Router {
    handlers: Vec<BoxedHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler. Earlier handlers take precedence.
    ///
    /// ```rust,no_run
    /// # use tessera::{Request, Response, Router, Routes};
    /// # async fn fallback(_: Request) -> Response { Response::text("") }
    /// # let api = Routes::new();
    /// Router::new()
    ///     .route(api)
    ///     .route(fallback);
    /// ```
    pub fn route(mut self, handler: impl Handler) -> Self {
        self.handlers.push(handler.into_boxed_handler());
        self
    }

    /// Appends every handler of `other`, keeping its order.
    pub fn merge(mut self, other: Router) -> Self {
        self.handlers.extend(other.handlers);
        self
    }

    pub fn len(&self) -> usize { self.handlers.len() }
    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }
}

impl private::Sealed for Router {}

impl Handler for Router {
    fn into_boxed_handler(self) -> BoxedHandler {
        combine(self.handlers)
    }
}

/// Merges `handlers` into one handler with first-match-wins semantics.
///
/// An empty sequence yields a handler that declines everything.
pub fn combine(handlers: impl IntoIterator<Item = BoxedHandler>) -> BoxedHandler {
    let handlers: Arc<[BoxedHandler]> = handlers.into_iter().collect();
    BoxedHandler::new(FirstMatch { handlers })
}

struct FirstMatch {
    handlers: Arc<[BoxedHandler]>,
}

impl ErasedHandler for FirstMatch {
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        let handlers = Arc::clone(&self.handlers);
        Box::pin(async move {
            for (index, handler) in handlers.iter().enumerate() {
                match handler.call(req.clone()).await {
                    Outcome::NotHandled => continue,
                    decided => {
                        trace!(index, outcome = decided.kind(), "router matched");
                        return decided;
                    }
                }
            }
            Outcome::NotHandled
        })
    }
}
