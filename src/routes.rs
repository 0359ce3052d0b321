//! Method + path table as a partial handler.
//!
//! One radix tree per HTTP method, O(path-length) lookup via [`matchit`].
//! A request whose method or path is not in the table is declined with
//! [`Outcome::NotHandled`], so a [`Routes`] table is just another handler to
//! put in a [`Router`](crate::Router).

use std::collections::HashMap;

use http::Method;
use matchit::Router as MatchitRouter;
use tracing::trace;

use crate::effect::BoxFuture;
use crate::handler::{BoxedHandler, ErasedHandler, Handler, Outcome, private};
use crate::request::Request;

/// A table of routes. Build it once at startup.
#[derive(Default)]
pub struct Routes {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them:
    ///
    /// ```rust,no_run
    /// # use tessera::{Request, Response, Routes};
    /// # use http::Method;
    /// # async fn get_user(_: Request) -> Response { Response::text("") }
    /// # async fn create_user(_: Request) -> Response { Response::text("") }
    /// Routes::new()
    ///     .on(Method::GET,  "/users/{id}", get_user)
    ///     .on(Method::POST, "/users",      create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid pattern or conflicts with one already
    /// registered for `method`. Route tables are static; this is a build bug.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::DELETE, path, handler)
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<(BoxedHandler, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((matched.value.clone(), params))
    }
}

impl private::Sealed for Routes {}

impl Handler for Routes {
    fn into_boxed_handler(self) -> BoxedHandler {
        BoxedHandler::new(self)
    }
}

impl ErasedHandler for Routes {
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        match self.lookup(req.method(), req.path()) {
            Some((handler, params)) => handler.call(req.with_params(params)),
            None => {
                trace!(method = %req.method(), path = req.path(), "no route in table");
                Box::pin(std::future::ready(Outcome::NotHandled))
            }
        }
    }
}
