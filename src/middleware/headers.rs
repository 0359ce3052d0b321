use super::{Middleware, Next, from_fn};
use crate::request::Request;

/// Appends `name: value` to every handled response.
///
/// Declined and failed outcomes pass through untouched.
pub fn set_header(name: impl Into<String>, value: impl Into<String>) -> impl Middleware {
    let name = name.into();
    let value = value.into();
    from_fn(move |req: Request, next: Next| {
        let name = name.clone();
        let value = value.clone();
        async move {
            next.run(req).await.map_response(|mut res| {
                res.append_header(name, value);
                res
            })
        }
    })
    .named("set_header")
}
