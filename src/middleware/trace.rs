use std::time::Instant;

use tracing::{Instrument, info, warn};

use super::{Middleware, Next, from_fn};
use crate::effect::millis;
use crate::handler::Outcome;
use crate::request::Request;

/// Per-request span with method and path; logs outcome, status and latency.
pub fn trace() -> impl Middleware {
    from_fn(|req: Request, next: Next| {
        let span = tracing::info_span!(
            "request",
            http.method = %req.method(),
            http.path = req.path(),
        );

        async move {
            let start = Instant::now();
            let outcome = next.run(req).await;
            let latency_ms = millis(start.elapsed());

            match &outcome {
                Outcome::Handled(res) => {
                    info!(status = res.status_code().as_u16(), latency_ms, "request handled");
                }
                Outcome::NotHandled => info!(latency_ms, "request not handled"),
                Outcome::Failed(err) => warn!(error = %err, latency_ms, "request failed"),
            }
            outcome
        }
        .instrument(span)
    })
    .named("trace")
}
