//! Authenticated namespaces.
//!
//! An [`AuthenticatedRouter`] guards a path prefix. For each request under
//! the prefix it runs an [`Authenticator`]; on success the inner handler
//! receives the principal, on failure the configured [`AuthPolicy`] decides:
//!
//! ```text
//! Start ─▶ Authenticating ─┬─ Ok(principal) ─▶ inner(req, principal)  (outcome propagated unchanged)
//!                          └─ Err(auth)     ─┬─ Strict      ─▶ Failed(Authentication)
//!                                            └─ Fallthrough ─▶ NotHandled
//! ```
//!
//! Strict is the default. Fallthrough lets a later plain handler in the same
//! [`Router`](crate::Router) claim requests the namespace rejected. In both
//! modes the inner handler is never invoked without a principal.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::effect::BoxFuture;
use crate::error::{AuthError, DispatchError};
use crate::handler::{BoxedHandler, ErasedHandler, Handler, IntoOutcome, Outcome, private};
use crate::request::Request;

/// What a namespace does with a request that fails authentication.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthPolicy {
    /// Reject with an authentication failure.
    #[default]
    Strict,
    /// Decline so the next handler may claim the request.
    Fallthrough,
}

// ── Authenticator ─────────────────────────────────────────────────────────────

/// Extracts a principal from a request.
///
/// Implemented for any `Fn(Request) -> impl Future<Output = Result<P, AuthError>>`.
pub trait Authenticator<P>: Send + Sync + 'static {
    fn authenticate(&self, req: Request) -> BoxFuture<'static, Result<P, AuthError>>;
}

impl<P, F, Fut> Authenticator<P> for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P, AuthError>> + Send + 'static,
{
    fn authenticate(&self, req: Request) -> BoxFuture<'static, Result<P, AuthError>> {
        Box::pin((self)(req))
    }
}

/// Static `Authorization: Bearer <token>` lookup.
pub struct BearerTokens<P> {
    tokens: HashMap<String, P>,
}

impl<P> BearerTokens<P> {
    pub fn new(tokens: HashMap<String, P>) -> Self {
        Self { tokens }
    }
}

impl<P: Clone + Send + Sync + 'static> Authenticator<P> for BearerTokens<P> {
    fn authenticate(&self, req: Request) -> BoxFuture<'static, Result<P, AuthError>> {
        let result = match req.header("authorization").and_then(|v| v.strip_prefix("Bearer ")) {
            None => Err(AuthError::missing_credentials()),
            Some(token) => self.tokens.get(token.trim()).cloned().ok_or_else(AuthError::invalid_credentials),
        };
        Box::pin(std::future::ready(result))
    }
}

// ── Principal-aware handlers ──────────────────────────────────────────────────

/// A handler that needs the authenticated principal.
///
/// Implemented for any `Fn(Request, P) -> impl Future<Output = impl IntoOutcome>`,
/// and for plain handlers wrapped with [`scoped`].
pub trait PrincipalHandler<P>: Send + Sync + 'static {
    fn call(&self, req: Request, principal: P) -> BoxFuture<'static, Outcome>;
}

impl<P, F, Fut, O> PrincipalHandler<P> for F
where
    F: Fn(Request, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: IntoOutcome + Send + 'static,
{
    fn call(&self, req: Request, principal: P) -> BoxFuture<'static, Outcome> {
        let fut = (self)(req, principal);
        Box::pin(async move { fut.await.into_outcome() })
    }
}

/// Adapts a plain handler (a [`Routes`](crate::Routes) table, a whole
/// [`Router`](crate::Router)) to run inside a namespace.
///
/// The principal rides along on a derived request and is read with
/// [`Request::principal`]; it lives exactly as long as that request.
pub fn scoped<P>(handler: impl Handler) -> Scoped<P> {
    Scoped { inner: handler.into_boxed_handler(), _principal: PhantomData }
}

pub struct Scoped<P> {
    inner: BoxedHandler,
    _principal: PhantomData<fn(P)>,
}

impl<P: Send + Sync + 'static> PrincipalHandler<P> for Scoped<P> {
    fn call(&self, req: Request, principal: P) -> BoxFuture<'static, Outcome> {
        self.inner.call(req.with_principal(principal))
    }
}

// ── AuthenticatedRouter ───────────────────────────────────────────────────────

/// A namespace requiring a principal before delegating.
pub struct AuthenticatedRouter<P> {
    prefix: Option<String>,
    policy: AuthPolicy,
    authenticator: Arc<dyn Authenticator<P>>,
    inner: Arc<dyn PrincipalHandler<P>>,
}

impl<P: Send + 'static> AuthenticatedRouter<P> {
    /// Guards every request with `authenticator`. Strict by default.
    pub fn new(authenticator: impl Authenticator<P>, inner: impl PrincipalHandler<P>) -> Self {
        Self {
            prefix: None,
            policy: AuthPolicy::default(),
            authenticator: Arc::new(authenticator),
            inner: Arc::new(inner),
        }
    }

    /// Limits the namespace to `prefix` and paths below it. Requests outside
    /// are declined without being authenticated.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_owned();
        self.prefix = Some(prefix);
        self
    }

    pub fn policy(mut self, policy: AuthPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shorthand for `.policy(AuthPolicy::Fallthrough)`.
    pub fn fallthrough(self) -> Self {
        self.policy(AuthPolicy::Fallthrough)
    }

    fn covers(&self, path: &str) -> bool {
        match &self.prefix {
            None => true,
            Some(prefix) if prefix.is_empty() => true,
            Some(prefix) => match path.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }
}

impl<P> private::Sealed for AuthenticatedRouter<P> {}

impl<P: Send + 'static> Handler for AuthenticatedRouter<P> {
    fn into_boxed_handler(self) -> BoxedHandler {
        BoxedHandler::new(self)
    }
}

impl<P: Send + 'static> ErasedHandler for AuthenticatedRouter<P> {
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        if !self.covers(req.path()) {
            return Box::pin(std::future::ready(Outcome::NotHandled));
        }

        let authenticating = self.authenticator.authenticate(req.clone());
        let inner = Arc::clone(&self.inner);
        let policy = self.policy;

        Box::pin(async move {
            match authenticating.await {
                Ok(principal) => inner.call(req, principal).await,
                Err(err) => match policy {
                    AuthPolicy::Fallthrough => {
                        debug!(path = req.path(), reason = err.reason(), "authentication failed, falling through");
                        Outcome::NotHandled
                    }
                    AuthPolicy::Strict => {
                        debug!(path = req.path(), reason = err.reason(), "authentication failed, rejecting");
                        Outcome::Failed(DispatchError::Authentication(err))
                    }
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::response::Response;
    use crate::router::Router;
    use crate::routes::Routes;

    fn get(uri: &str, token: Option<&str>) -> Request {
        let mut builder = http::Request::get(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Bytes::new()).unwrap().into()
    }

    async fn always_fail(_req: Request) -> Result<String, AuthError> {
        Err(AuthError::invalid_credentials())
    }

    fn counted(counter: &Arc<AtomicUsize>, body: &'static str) -> impl Handler {
        let counter = Arc::clone(counter);
        move |_req: Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Response::text(body) }
        }
    }

    fn body_of(outcome: Outcome) -> String {
        match outcome {
            Outcome::Handled(res) => String::from_utf8(res.body().to_vec()).unwrap(),
            other => panic!("expected handled, got {other:?}"),
        }
    }

    fn protected(counter: &Arc<AtomicUsize>) -> impl PrincipalHandler<String> {
        let counter = Arc::clone(counter);
        move |_req: Request, _who: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Response::text("secret") }
        }
    }

    #[tokio::test]
    async fn test_fallthrough_lets_next_handler_claim() {
        let inner_hits = Arc::new(AtomicUsize::new(0));
        let plain_hits = Arc::new(AtomicUsize::new(0));

        let app = Router::new()
            .route(AuthenticatedRouter::new(always_fail, protected(&inner_hits)).fallthrough())
            .route(counted(&plain_hits, "public"))
            .into_boxed_handler();

        assert_eq!(body_of(app.call(get("/reports", None)).await), "public");
        assert_eq!(inner_hits.load(Ordering::SeqCst), 0);
        assert_eq!(plain_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strict_fails_and_blocks_next_handler() {
        let inner_hits = Arc::new(AtomicUsize::new(0));
        let plain_hits = Arc::new(AtomicUsize::new(0));

        let app = Router::new()
            .route(AuthenticatedRouter::new(always_fail, protected(&inner_hits)))
            .route(counted(&plain_hits, "public"))
            .into_boxed_handler();

        let outcome = app.call(get("/reports", None)).await;
        assert!(matches!(outcome, Outcome::Failed(DispatchError::Authentication(_))));
        assert_eq!(inner_hits.load(Ordering::SeqCst), 0);
        assert_eq!(plain_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_principal_reaches_inner_handler() {
        let auth = BearerTokens::new(HashMap::from([("t0k".to_owned(), "alice".to_owned())]));
        let ns = AuthenticatedRouter::new(auth, |_req: Request, who: String| async move {
            Response::text(format!("hello {who}"))
        })
        .into_boxed_handler();

        assert_eq!(body_of(ns.call(get("/", Some("t0k"))).await), "hello alice");
    }

    #[tokio::test]
    async fn test_inner_failure_propagates_unchanged() {
        let auth = |_req: Request| async { Ok::<_, AuthError>(1u32) };
        let ns = AuthenticatedRouter::new(auth, |_req: Request, _id: u32| async {
            Err::<Response, _>(crate::error::HandlerError::new("boom"))
        })
        .fallthrough()
        .into_boxed_handler();

        let outcome = ns.call(get("/", None)).await;
        assert!(matches!(outcome, Outcome::Failed(DispatchError::Handler(_))));
    }

    #[tokio::test]
    async fn test_outside_prefix_declines_without_authenticating() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let auth = move |_req: Request| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err::<String, _>(AuthError::missing_credentials()) }
        };
        let ns = AuthenticatedRouter::new(auth, |_req: Request, _p: String| async { "x" })
            .prefix("/admin/")
            .into_boxed_handler();

        assert!(ns.call(get("/administrator", None)).await.is_not_handled());
        assert!(ns.call(get("/public", None)).await.is_not_handled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(ns.call(get("/admin", None)).await.is_failed());
        assert!(ns.call(get("/admin/users", None)).await.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scoped_routes_read_principal_from_request() {
        let auth = BearerTokens::new(HashMap::from([("k".to_owned(), "ops".to_owned())]));
        let routes = Routes::new().get("/admin/whoami", |req: Request| async move {
            Response::text(req.principal::<String>().cloned().unwrap_or_default())
        });
        let ns = AuthenticatedRouter::new(auth, scoped::<String>(routes))
            .prefix("/admin")
            .into_boxed_handler();

        assert_eq!(body_of(ns.call(get("/admin/whoami", Some("k"))).await), "ops");
        assert!(ns.call(get("/admin/nope", Some("k"))).await.is_not_handled());
    }

    #[tokio::test]
    async fn test_bearer_tokens_reject_unknown_and_missing() {
        let auth = BearerTokens::new(HashMap::from([("k".to_owned(), ())]));
        let missing = auth.authenticate(get("/", None)).await.unwrap_err();
        let unknown = auth.authenticate(get("/", Some("other"))).await.unwrap_err();

        assert_eq!(missing.reason(), "missing credentials");
        assert_eq!(unknown.reason(), "invalid credentials");
    }

    #[test]
    fn test_policy_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Holder {
            policy: AuthPolicy,
        }

        let holder: Holder = config::Config::builder()
            .set_override("policy", "fallthrough")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(holder.policy, AuthPolicy::Fallthrough);
    }
}
