use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Uri, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::{Instrument, debug, info_span};

use super::{ReleaseToken, Resource};
use crate::effect::{BoxError, BoxFuture};

const USER_AGENT: &str = concat!("tessera/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("http client has been released")]
    Closed,
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("connection error: {0}")]
    Connection(#[from] hyper_util::client::legacy::Error),
    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Pooled outbound HTTP/1.1 client, shared by every handler.
///
/// Responses are buffered in full. Once released, every call returns
/// [`ClientError::Closed`] and the pooled connections are dropped with the
/// last handle.
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
    closed: AtomicBool,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();
        Self { client, timeout, closed: AtomicBool::new(false) }
    }

    pub async fn get(&self, uri: &str) -> Result<http::Response<Bytes>, ClientError> {
        let req = Request::builder().method(Method::GET).uri(uri).body(Full::default())?;
        self.send(req).await
    }

    pub async fn post(
        &self,
        uri: &str,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<http::Response<Bytes>, ClientError> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Full::new(body.into()))?;
        self.send(req).await
    }

    /// Sends `req` and collects the whole response body.
    pub async fn send(&self, mut req: Request<Full<Bytes>>) -> Result<http::Response<Bytes>, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        req.headers_mut()
            .entry(header::USER_AGENT)
            .or_insert(HeaderValue::from_static(USER_AGENT));

        let span = info_span!(
            "outbound",
            http.method = %req.method(),
            http.uri = %req.uri(),
            http.status_code = tracing::field::Empty,
        );
        let call = async {
            let res = self.client.request(req).await?;
            tracing::Span::current().record("http.status_code", res.status().as_u16());
            let (parts, body) = res.into_parts();
            let body = body.collect().await?.to_bytes();
            debug!(bytes = body.len(), "outbound response collected");
            Ok::<_, ClientError>(http::Response::from_parts(parts, body))
        };

        match tokio::time::timeout(self.timeout, call.instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        }
    }

    /// `true` when `uri` answers with a 2xx status.
    pub async fn is_reachable(&self, uri: Uri) -> bool {
        let req = match Request::builder().method(Method::HEAD).uri(uri).body(Full::default()) {
            Ok(req) => req,
            Err(_) => return false,
        };
        matches!(self.send(req).await, Ok(res) if res.status().is_success())
    }
}

impl Resource for HttpClient {
    fn release(&self, _token: ReleaseToken) -> BoxFuture<'_, Result<(), BoxError>> {
        self.closed.store(true, Ordering::Release);
        Box::pin(std::future::ready(Ok(())))
    }
}
