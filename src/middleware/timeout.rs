use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{Middleware, Next, from_fn};
use crate::effect::{Timer, with_deadline};
use crate::error::HandlerError;
use crate::handler::Outcome;
use crate::request::Request;

/// Fails requests whose handler does not finish within `limit`.
///
/// The unfinished handler future is dropped; the request becomes
/// `Failed(Handler)` and is answered like any other handler fault.
pub fn timeout(timer: Arc<dyn Timer>, limit: Duration) -> impl Middleware {
    from_fn(move |req: Request, next: Next| {
        let timer = Arc::clone(&timer);
        async move {
            let path = req.path().to_owned();
            match with_deadline(timer.as_ref(), limit, next.run(req)).await {
                Some(outcome) => outcome,
                None => {
                    warn!(%path, ?limit, "request timed out");
                    Outcome::Failed(HandlerError::timed_out(limit).into())
                }
            }
        }
    })
    .named("timeout")
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::effect::TokioTimer;
    use crate::error::DispatchError;
    use crate::middleware::Pipeline;
    use crate::response::Response;

    fn req() -> Request {
        http::Request::get("/slow").body(Bytes::new()).unwrap().into()
    }

    #[tokio::test]
    async fn test_slow_handler_fails() {
        let slow = |_req: Request| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Response::text("late")
        };
        let app = Pipeline::new()
            .layer(timeout(Arc::new(TokioTimer), Duration::from_millis(20)))
            .apply(slow);

        let outcome = app.call(req()).await;
        assert!(matches!(outcome, Outcome::Failed(DispatchError::Handler(_))));
    }

    #[tokio::test]
    async fn test_fast_handler_passes() {
        let fast = |_req: Request| async { Response::text("quick") };
        let app = Pipeline::new()
            .layer(timeout(Arc::new(TokioTimer), Duration::from_secs(5)))
            .apply(fast);

        assert!(app.call(req()).await.is_handled());
    }
}
