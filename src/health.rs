//! Built-in Kubernetes health-check handlers.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can the pod serve traffic? Failure → pulled from load-balancer. |
//!
//! Put them first in the router so no authenticated namespace sees them:
//!
//! ```rust,no_run
//! use tessera::{Router, health};
//!
//! let app = Router::new().route(health::routes());
//! ```
//!
//! Once shutdown starts the server answers every request, probes included,
//! with `503`, which is what takes the pod out of rotation.

use crate::{Request, Response, Routes};

/// `GET /healthz` and `GET /readyz`.
pub fn routes() -> Routes {
    Routes::new().get("/healthz", liveness).get("/readyz", readiness)
}

/// Always `200 OK` with body `"ok"`. No dependencies.
pub async fn liveness(_req: Request) -> Response {
    Response::text("ok")
}

/// `200 OK` with body `"ready"`.
pub async fn readiness(_req: Request) -> Response {
    Response::text("ready")
}
