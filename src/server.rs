//! Process lifecycle: acquire, serve, drain, release.
//!
//! ```text
//! start ─▶ acquire resources ─▶ build handlers ─▶ wrap in pipeline ─▶ bind ─▶ accept …
//!                                                                             │
//!               shutdown ─▶ stop accepting ─▶ drain (bounded) ─▶ release_all ◀┘
//! ```
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//! [`Server::serve`] reacts by:
//!
//! 1. Closing the listener. New connections are refused.
//! 2. Asking every open connection to finish its current request and close.
//!    Requests that still reach the dispatcher get `503 Service Unavailable`.
//! 3. Waiting up to the drain timeout for in-flight requests. Whatever is
//!    still running then is abandoned and reported as a [`DrainTimeout`].
//! 4. Releasing every resource in reverse acquisition order.
//!
//! Keep the drain timeout below `terminationGracePeriodSeconds` so release
//! gets to run before SIGKILL.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::effect::{Timer, TokioTimer, bracket, millis, with_deadline};
use crate::error::{DispatchError, DrainTimeout, Error, ReleaseErrors};
use crate::handler::{BoxedHandler, Handler, Outcome};
use crate::middleware::Pipeline;
use crate::request::Request;
use crate::resource::ResourceManager;
use crate::response::Response;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
    drain_timeout: Duration,
    pipeline: Pipeline,
    timer: Arc<dyn Timer>,
}

impl Server {
    /// Configures the server to bind to `addr` once startup succeeds.
    ///
    /// ```rust,no_run
    /// use tessera::Server;
    /// let server = Server::bind(([0, 0, 0, 0], 3000).into());
    /// ```
    pub fn bind(addr: SocketAddr) -> Self {
        Self {
            addr,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            pipeline: Pipeline::new(),
            timer: Arc::new(TokioTimer),
        }
    }

    /// Address, drain timeout and middleware pipeline from `config`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let timer: Arc<dyn Timer> = Arc::new(TokioTimer);
        let pipeline = Pipeline::from_config(&config.middleware, Arc::clone(&timer));
        Ok(Self::bind(config.bind_addr()?)
            .drain_timeout(config.drain_timeout())
            .pipeline(pipeline)
            .timer(timer))
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Middleware wrapped around the whole handler set, outermost first.
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Clock for the drain deadline.
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Runs startup and returns once the listener is bound.
    ///
    /// `build` receives the [`ResourceManager`], acquires whatever it needs and
    /// returns the composed handler set (usually a [`Router`](crate::Router)).
    /// If `build` fails or panics, every resource it already acquired is
    /// released and the port is never bound.
    pub async fn start<B, Fut, H>(self, build: B) -> Result<RunningServer, Error>
    where
        B: FnOnce(Arc<ResourceManager>) -> Fut,
        Fut: Future<Output = Result<H, Error>>,
        H: Handler,
    {
        let resources = Arc::new(ResourceManager::new());

        let shared = Arc::clone(&resources);
        let building = AssertUnwindSafe(async move { build(shared).await }).catch_unwind();
        let handler = match building.await {
            Ok(Ok(handler)) => handler,
            Ok(Err(e)) => {
                error!(error = %e, "startup failed, releasing acquired resources");
                release_after_failed_startup(&resources).await;
                return Err(e);
            }
            Err(_panic) => {
                error!("startup panicked, releasing acquired resources");
                release_after_failed_startup(&resources).await;
                return Err(Error::Startup("startup panicked".into()));
            }
        };
        let app = self.pipeline.apply(handler);
        debug!(middleware = ?self.pipeline.names(), "pipeline assembled");

        let bound = async {
            let listener = TcpListener::bind(self.addr).await?;
            let local_addr = listener.local_addr()?;
            Ok::<_, std::io::Error>((listener, local_addr))
        };
        let (listener, local_addr) = match bound.await {
            Ok(bound) => bound,
            Err(e) => {
                error!(addr = %self.addr, error = %e, "bind failed, releasing acquired resources");
                release_after_failed_startup(&resources).await;
                return Err(e.into());
            }
        };
        info!(addr = %local_addr, "tessera listening");

        let token = CancellationToken::new();
        let lifecycle = Lifecycle {
            app,
            token: token.clone(),
            drain_timeout: self.drain_timeout,
            timer: self.timer,
        };
        let task = tokio::spawn(lifecycle.run(listener, resources));

        Ok(RunningServer { local_addr, token, task })
    }

    /// Starts the server and runs it until SIGTERM or Ctrl-C.
    ///
    /// Returns after draining and releasing. A drain timeout is logged but is
    /// not an error; failed releases are.
    pub async fn serve<B, Fut, H>(self, build: B) -> Result<(), Error>
    where
        B: FnOnce(Arc<ResourceManager>) -> Fut,
        Fut: Future<Output = Result<H, Error>>,
        H: Handler,
    {
        let running = self.start(build).await?;
        shutdown_signal().await;
        let report = running.stop().await?;
        report.release?;
        Ok(())
    }
}

async fn release_after_failed_startup(resources: &ResourceManager) {
    if let Err(errs) = resources.release_all().await {
        error!(error = %errs, "release after failed startup was incomplete");
    }
}

// ── Running server ────────────────────────────────────────────────────────────

/// Handle to a started server.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<ShutdownReport>,
}

impl RunningServer {
    /// The bound address. Useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts shutdown without waiting for it.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Waits for the server to finish shutting down.
    pub async fn wait(self) -> Result<ShutdownReport, Error> {
        Ok(self.task.await?)
    }

    /// [`shutdown`](Self::shutdown) then [`wait`](Self::wait).
    pub async fn stop(self) -> Result<ShutdownReport, Error> {
        self.shutdown();
        self.wait().await
    }
}

/// What happened during shutdown.
#[derive(Debug)]
pub struct ShutdownReport {
    pub drain: Result<(), DrainTimeout>,
    pub release: Result<(), ReleaseErrors>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.drain.is_ok() && self.release.is_ok()
    }
}

// ── Serving ───────────────────────────────────────────────────────────────────

struct Lifecycle {
    app: BoxedHandler,
    token: CancellationToken,
    drain_timeout: Duration,
    timer: Arc<dyn Timer>,
}

impl Lifecycle {
    async fn run(self, listener: TcpListener, resources: Arc<ResourceManager>) -> ShutdownReport {
        let acquired = std::future::ready(Ok::<_, Infallible>(resources));
        let outcome = bracket(
            acquired,
            |_| self.accept_and_drain(listener),
            |resources| async move { resources.release_all().await },
        )
        .await;

        let (drain, release) = match outcome {
            Ok(pair) => pair,
            Err(never) => match never {},
        };
        match &release {
            Ok(()) => info!("tessera stopped"),
            Err(errs) => error!(error = %errs, "tessera stopped with release failures"),
        }
        ShutdownReport { drain, release }
    }

    async fn accept_and_drain(&self, listener: TcpListener) -> Result<(), DrainTimeout> {
        let gate = Gate { token: self.token.clone(), in_flight: Arc::default() };
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Shutdown first so a cancelled server stops accepting even
                // when more connections are queued.
                biased;

                () = self.token.cancelled() => {
                    info!(
                        connections = connections.len(),
                        in_flight = gate.in_flight(),
                        "shutdown requested, draining"
                    );
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(stream, peer, self.app.clone(), gate.clone()));
                }

                // Reap finished connection tasks so the set does not grow
                // without bound on long-running servers.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        let drained = with_deadline(self.timer.as_ref(), self.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_some() {
            info!("drain complete");
            return Ok(());
        }

        let timeout = DrainTimeout { timeout: self.drain_timeout, abandoned: gate.in_flight() };
        warn!(
            timeout_ms = millis(self.drain_timeout),
            abandoned = timeout.abandoned,
            "drain timed out, abandoning in-flight requests"
        );
        connections.shutdown().await;
        Err(timeout)
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, app: BoxedHandler, gate: Gate) {
    let token = gate.token.clone();
    let svc = service_fn(move |req| dispatch(app.clone(), req, gate.clone()));

    // `auto::Builder` handles both HTTP/1.1 and HTTP/2, whatever the client
    // negotiates.
    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    let mut conn = std::pin::pin!(conn);
    let cancelled = token.cancelled();
    let mut cancelled = std::pin::pin!(cancelled);
    let mut closing = false;

    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(%peer, "connection error: {e}");
                }
                break;
            }
            () = &mut cancelled, if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Admission control and the in-flight request count.
#[derive(Clone)]
struct Gate {
    token: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

impl Gate {
    fn admit(&self) -> Option<Admitted> {
        if self.token.is_cancelled() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(Admitted(Arc::clone(&self.in_flight)))
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct Admitted(Arc<AtomicUsize>);

impl Drop for Admitted {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Core hot path: admits one request, runs the pipeline, maps the outcome.
///
/// The error type is [`Infallible`]: every failure becomes a response here so
/// hyper never sees an error.
async fn dispatch(
    app: BoxedHandler,
    req: hyper::Request<Incoming>,
    gate: Gate,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let Some(_admitted) = gate.admit() else {
        debug!(path = req.uri().path(), "rejecting request during shutdown");
        return Ok(shutting_down().into_http());
    };

    let req = match Request::from_incoming(req).await {
        Ok(req) => req,
        Err(e) => {
            debug!("failed to read request body: {e}");
            return Ok(Response::builder().status(StatusCode::BAD_REQUEST).text("malformed request body").into_http());
        }
    };

    let response = match AssertUnwindSafe(app.call(req)).catch_unwind().await {
        Ok(outcome) => respond(outcome),
        Err(_) => {
            error!("handler panicked");
            internal_error()
        }
    };
    Ok(response.into_http())
}

/// Maps a dispatch outcome to the response sent on the wire.
///
/// | Outcome | Status |
/// |---|---|
/// | `Handled(res)` | `res` unchanged |
/// | `NotHandled` | `404 Not Found` |
/// | `Failed(Authentication)` | `401 Unauthorized` with `www-authenticate: Bearer` |
/// | `Failed(Handler)` | `500 Internal Server Error`, details only in the log |
pub fn respond(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Handled(res) => res,
        Outcome::NotHandled => Response::builder().status(StatusCode::NOT_FOUND).text("not found"),
        Outcome::Failed(DispatchError::Authentication(e)) => {
            debug!(reason = e.reason(), "authentication failed");
            Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("www-authenticate", "Bearer")
                .text(e.reason().to_owned())
        }
        Outcome::Failed(DispatchError::Handler(e)) => {
            error!(error = %e, "handler failed");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).text("internal server error")
}

fn shutting_down() -> Response {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("connection", "close")
        .text("shutting down")
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by `kubectl` and the
/// Kubernetes control plane) and **SIGINT** (Ctrl-C, for local dev).
/// On Windows only Ctrl-C is available. A handler that cannot be installed
/// is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => info!("received Ctrl-C"),
        () = sigterm  => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, HandlerError};

    #[test]
    fn test_not_handled_is_404() {
        let res = respond(Outcome::NotHandled);
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_authentication_failure_is_401_with_challenge() {
        let res = respond(Outcome::Failed(AuthError::missing_credentials().into()));
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.header("www-authenticate"), Some("Bearer"));
        assert_eq!(res.body().as_ref(), b"missing credentials");
    }

    #[test]
    fn test_handler_failure_is_500_without_details() {
        let res = respond(Outcome::Failed(HandlerError::new("db password is hunter2").into()));
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!String::from_utf8_lossy(res.body()).contains("hunter2"));
    }

    #[test]
    fn test_handled_passes_through() {
        let res = respond(Outcome::Handled(Response::builder().status(StatusCode::CREATED).no_body()));
        assert_eq!(res.status_code(), StatusCode::CREATED);
    }

    #[test]
    fn test_gate_counts_and_closes() {
        let gate = Gate { token: CancellationToken::new(), in_flight: Arc::default() };
        let first = gate.admit().unwrap();
        let second = gate.admit().unwrap();
        assert_eq!(gate.in_flight(), 2);
        drop(first);
        assert_eq!(gate.in_flight(), 1);

        gate.token.cancel();
        assert!(gate.admit().is_none());
        drop(second);
        assert_eq!(gate.in_flight(), 0);
    }
}
