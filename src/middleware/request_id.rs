use tracing::Instrument;
use uuid::Uuid;

use super::{Middleware, Next, from_fn};
use crate::request::Request;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Tags each request with an id and echoes it on the response.
///
/// An id supplied by the client (or the proxy in front) in `x-request-id` is
/// reused; otherwise a v4 UUID is generated. Work inside the wrapped handler
/// runs in a `request_id` span carrying the id.
pub fn request_id() -> impl Middleware {
    from_fn(|req: Request, next: Next| {
        let id = req
            .header(REQUEST_ID_HEADER)
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = tracing::info_span!("request_id", id = %id);

        async move {
            next.run(req).await.map_response(|mut res| {
                res.append_header(REQUEST_ID_HEADER, id);
                res
            })
        }
        .instrument(span)
    })
    .named("request_id")
}
