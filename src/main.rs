//! Demo service: health probes, an authenticated admin namespace and an
//! in-process event topic.
//!
//! Run with:
//!   cargo run -- --config tessera.toml
//!
//! Try:
//!   curl http://localhost:3000/healthz
//!   curl -H 'authorization: Bearer s3cret' http://localhost:3000/admin/whoami
//!   curl -X POST -H 'authorization: Bearer s3cret' -d 'deployed' http://localhost:3000/admin/events
//!   curl http://localhost:3000/hello/alice

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use tessera::auth::scoped;
use tessera::effect::concurrently;
use tessera::{
    AuthenticatedRouter, BearerTokens, Config, HandlerError, HttpClient, Request, ResourceManager,
    Response, Router, Routes, Scheduler, Server, Topic, health, tracing_setup,
};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Command>,

    /// Configuration file (TOML, YAML or JSON). Defaults only when omitted.
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Load and validate the configuration, then exit
    Validate,
    /// Start the server (default)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).wrap_err("failed to load configuration")?;
    tracing_setup::init(&config.log)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Validate => {
            info!(bind = %config.bind, middleware = config.middleware.len(), "configuration is valid");
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let server = Server::from_config(&config)?;
    server
        .serve(move |resources| build(resources, config))
        .await
        .wrap_err("server exited with an error")
}

async fn build(resources: Arc<ResourceManager>, config: Config) -> Result<Router, tessera::Error> {
    let client = resources
        .acquire("http-client", || async {
            Ok::<_, tessera::BoxError>(HttpClient::new(Duration::from_secs(5)))
        })
        .await?;
    let events = resources
        .acquire("events", || async { Ok::<_, tessera::BoxError>(Topic::<String>::new("events", 256)) })
        .await?;
    let scheduler = resources
        .acquire("scheduler", || async { Ok::<_, tessera::BoxError>(Scheduler::new()) })
        .await?;

    let mut audit = events.subscribe().map_err(|e| tessera::Error::Startup(e.into()))?;
    scheduler.every("event-audit", Duration::from_secs(10), move || {
        let mut drained = 0usize;
        while audit.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "events published since last audit");
        }
        std::future::ready(())
    });

    let admin_ns = config.namespaces.get("admin");
    let prefix = admin_ns.map_or("/admin", |ns| ns.prefix.trim_end_matches('/')).to_owned();
    let tokens = admin_ns.map(|ns| ns.tokens.clone()).unwrap_or_default();

    let admin_routes = Routes::new()
        .get(&format!("{prefix}/whoami"), whoami)
        .post(&format!("{prefix}/events"), {
            let events = Arc::clone(&events);
            move |req: Request| {
                let events = Arc::clone(&events);
                async move { publish(&events, &req) }
            }
        })
        .post(&format!("{prefix}/upstreams"), move |req: Request| {
            let client = Arc::clone(&client);
            async move { check_upstreams(&client, &req).await }
        });

    let admin = AuthenticatedRouter::new(BearerTokens::new(tokens), scoped::<String>(admin_routes))
        .prefix(prefix)
        .policy(config.policy_for("admin"));

    Ok(Router::new()
        .route(health::routes())
        .route(admin)
        .route(Routes::new().get("/hello/{name}", hello)))
}

async fn whoami(req: Request) -> Response {
    let who = req.principal::<String>().map_or("unknown", String::as_str);
    Response::json(format!(r#"{{"principal":"{who}"}}"#))
}

fn publish(events: &Topic<String>, req: &Request) -> Result<Response, HandlerError> {
    let message = String::from_utf8(req.body().to_vec())
        .map_err(|e| HandlerError::with_source("event body is not UTF-8", e))?;
    let delivered = events
        .publish(message)
        .map_err(|e| HandlerError::with_source("event topic unavailable", e))?;
    Ok(Response::json(format!(r#"{{"delivered":{delivered}}}"#)))
}

/// Body is one URI per line; each is checked concurrently.
async fn check_upstreams(client: &HttpClient, req: &Request) -> Response {
    let body = String::from_utf8_lossy(req.body());
    let uris: Vec<http::Uri> = body.lines().filter_map(|line| line.trim().parse().ok()).collect();
    let checks: Vec<_> = uris.iter().cloned().map(|uri| client.is_reachable(uri)).collect();
    let results = concurrently(checks).await;
    Response::json(availability_report(uris.into_iter().zip(results)))
}

fn availability_report(results: impl IntoIterator<Item = (http::Uri, bool)>) -> String {
    let entries: Vec<String> = results
        .into_iter()
        .map(|(uri, up)| format!(r#"{{"uri":"{uri}","up":{up}}}"#))
        .collect();
    format!("[{}]", entries.join(","))
}

async fn hello(req: Request) -> Response {
    Response::text(format!("hello, {}", req.param("name").unwrap_or("stranger")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_report_keeps_request_order() {
        let report = availability_report([
            ("http://a.internal/".parse().unwrap(), true),
            ("http://b.internal:8080/ready".parse().unwrap(), false),
        ]);
        assert_eq!(
            report,
            r#"[{"uri":"http://a.internal/","up":true},{"uri":"http://b.internal:8080/ready","up":false}]"#
        );
    }

    #[test]
    fn test_availability_report_of_nothing_is_empty_array() {
        assert_eq!(availability_report(Vec::new()), "[]");
    }

    #[tokio::test]
    async fn test_unparseable_lines_are_skipped() {
        let client = HttpClient::new(Duration::from_millis(200));
        let req: Request = http::Request::post("/admin/upstreams")
            .body(bytes::Bytes::from_static(b"not a uri\n\n"))
            .unwrap()
            .into();

        let res = check_upstreams(&client, &req).await;
        assert_eq!(res.body().as_ref(), b"[]");
    }
}
