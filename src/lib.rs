//! # tessera
//!
//! An HTTP service assembled from small pieces instead of one dispatcher.
//!
//! ## The pieces
//!
//! - **Handlers** are partial: a handler answers [`Outcome::Handled`],
//!   declines with [`Outcome::NotHandled`] ("not my route"), or reports
//!   [`Outcome::Failed`] ("mine, but it broke").
//! - A [`Router`] combines handlers first-match-wins. Declines fall through
//!   to the next handler; anything else stops the search.
//! - [`Routes`] is the leaf: a method + path table that declines on a miss.
//! - A [`middleware::Pipeline`] wraps handlers in middleware, first listed
//!   outermost.
//! - An [`AuthenticatedRouter`] guards a path prefix. Strict by default;
//!   fallthrough on request.
//! - The [`ResourceManager`] acquires shared infrastructure once and
//!   releases it once, in reverse order, after the server has drained.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use tessera::{HttpClient, Request, Response, Router, Routes, Server, health};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tessera::Error> {
//!     Server::bind(([0, 0, 0, 0], 3000).into())
//!         .serve(|resources| async move {
//!             let _client = resources
//!                 .acquire("http-client", || async {
//!                     Ok::<_, tessera::BoxError>(HttpClient::new(Duration::from_secs(5)))
//!                 })
//!                 .await?;
//!
//!             Ok(Router::new()
//!                 .route(health::routes())
//!                 .route(Routes::new().get("/users/{id}", get_user)))
//!         })
//!         .await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod routes;
mod server;

pub mod auth;
pub mod config;
pub mod effect;
pub mod health;
pub mod middleware;
pub mod resource;
pub mod tracing_setup;

pub use auth::{AuthPolicy, AuthenticatedRouter, BearerTokens};
pub use config::Config;
pub use effect::{BoxError, BoxFuture};
pub use error::{
    AcquisitionError, AuthError, DispatchError, DrainTimeout, Error, HandlerError, ReleaseError,
    ReleaseErrors,
};
pub use handler::{BoxedHandler, ErasedHandler, Handler, IntoOutcome, Outcome, not_handled};
pub use request::Request;
pub use resource::{HttpClient, Resource, ResourceManager, Scheduler, Topic};
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{Router, combine};
pub use routes::Routes;
pub use server::{RunningServer, Server, ShutdownReport, respond};
