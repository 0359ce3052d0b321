//! Incoming HTTP request type.
//!
//! A [`Request`] is immutable. Cloning is cheap (reference counts only) so a
//! [`Router`](crate::Router) can offer the same request to each candidate
//! handler in turn. Routing information (path params, the authenticated
//! principal) is attached by producing a *derived* request; the original is
//! never touched.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use http_body_util::BodyExt;

use crate::middleware::FailureSlot;

/// An incoming HTTP request with its body fully buffered.
#[derive(Clone)]
pub struct Request {
    head: Arc<http::request::Parts>,
    body: Bytes,
    params: Arc<HashMap<String, String>>,
    principal: Option<Arc<dyn Any + Send + Sync>>,
    failure: Option<FailureSlot>,
}

impl Request {
    /// Buffers a hyper request into a [`Request`].
    pub(crate) async fn from_incoming(
        req: hyper::Request<hyper::body::Incoming>,
    ) -> Result<Self, hyper::Error> {
        let (head, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Self::from_parts(head, body))
    }

    fn from_parts(head: http::request::Parts, body: Bytes) -> Self {
        Self {
            head: Arc::new(head),
            body,
            params: Arc::default(),
            principal: None,
            failure: None,
        }
    }

    pub fn method(&self) -> &Method { &self.head.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn query(&self) -> Option<&str> { self.head.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn body(&self) -> &Bytes { &self.body }

    /// Header lookup. Names are case-insensitive; non-UTF-8 values are skipped.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter captured by [`Routes`](crate::Routes).
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The principal attached by an [`AuthenticatedRouter`](crate::AuthenticatedRouter),
    /// if one of type `P` is present.
    pub fn principal<P: Send + Sync + 'static>(&self) -> Option<&P> {
        self.principal.as_deref().and_then(|p| p.downcast_ref::<P>())
    }

    pub(crate) fn with_params(&self, params: HashMap<String, String>) -> Self {
        Self { params: Arc::new(params), ..self.clone() }
    }

    pub(crate) fn with_principal<P: Send + Sync + 'static>(&self, principal: P) -> Self {
        Self { principal: Some(Arc::new(principal)), ..self.clone() }
    }

    pub(crate) fn with_failure_slot(&self, slot: FailureSlot) -> Self {
        Self { failure: Some(slot), ..self.clone() }
    }

    pub(crate) fn failure_slot(&self) -> Option<&FailureSlot> {
        self.failure.as_ref()
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (head, body) = req.into_parts();
        Self::from_parts(head, body)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", self.method())
            .field("uri", self.uri())
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}
