//! Development server: static files from the current build plus the
//! `/_events` API.
//!
//! | Route                        | Handler                               |
//! |------------------------------|---------------------------------------|
//! | `POST /_events/watch`        | [`stream::serve_watch`], own thread   |
//! | `POST /_events/sub`          | change a session's subscriptions      |
//! | `POST /_events/vote`         | record a poll vote                    |
//! | `POST /_events/terminate`    | shut down (loopback peers only)       |
//! | `GET  /_events/client.js`    | embedded client                       |
//! | anything else (`GET`/`HEAD`) | file from the served build directory  |

mod lifecycle;
mod path;
mod response;
mod stream;

#[cfg(test)]
mod tests;

use crate::{
    build::{BuildDirs, BuildScheduler, BuildState, CommandBuilder, Scanner, SchedulerSettings},
    config::cfg,
    core::{is_shutdown, register_server, request_shutdown},
    debug, embed,
    events::{
        Descriptor, EventError, EventHub, RequestContext, Sources, ValueObservable,
        protocol::{SubRequest, SubResult, VoteRequest},
    },
    log,
    store::{Dispatcher, Store, polls},
};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::{io::Read, sync::Arc, thread, time::Duration};
use tiny_http::{Method, Request, Server};

/// Largest accepted request body.
const MAX_BODY: u64 = 1 << 20;

/// Longest accepted voter id or answer.
const MAX_VOTE_FIELD: usize = 256;

/// Shared by every request handler.
struct ServeContext {
    hub: Arc<EventHub>,
    store: Store,
    builds: Arc<BuildState>,
    keepalive: Duration,
}

/// Run the server with the installed config until shutdown is requested.
pub fn serve() -> Result<()> {
    let config = cfg();
    let store = Store::open(&config.store.path, config.store.settings())
        .with_context(|| format!("failed to open {}", config.store.path.display()))?;
    let mut dispatcher = Dispatcher::spawn(store.clone(), config.store.poll_interval())?;

    let build_observable = Arc::new(ValueObservable::new(Value::Null));
    let hub = Arc::new(EventHub::new(Sources {
        build: Arc::clone(&build_observable),
        store: store.clone(),
        tick: config.events.tick(),
    }));
    let builds = Arc::new(BuildState::new());

    let (server, addr) = lifecycle::bind_with_retry(config.serve.interface, config.serve.port)?;
    let server = Arc::new(server);
    register_server(Arc::clone(&server));
    log!("serve"; "http://{}", addr);

    let scheduler = BuildScheduler::new(
        Scanner::new(config.build.sources.clone(), config.build.exclude_regex()?),
        BuildDirs::new(&config.build.root, addr.port()),
        Box::new(CommandBuilder::new(config.build.command.clone(), &config.root)),
        Arc::clone(&builds),
        build_observable,
        SchedulerSettings::from_config(&config),
    );
    scheduler.prepare()?;
    let build_thread = scheduler.spawn()?;

    if let Some(timeout) = config.serve.idle_timeout() {
        lifecycle::spawn_idle_watchdog(Arc::clone(&hub), timeout)?;
    }

    let ctx = Arc::new(ServeContext {
        hub,
        store,
        builds,
        keepalive: config.events.keepalive(),
    });
    run_request_loop(&server, &ctx)?;

    lifecycle::wait_for_thread(build_thread);
    dispatcher.shutdown();
    Ok(())
}

fn run_request_loop(server: &Server, ctx: &Arc<ServeContext>) -> Result<()> {
    // Watch streams live for the whole session; everything else is short
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(4)
        .thread_name(|i| format!("http-{i}"))
        .build()
        .context("failed to create thread pool")?;

    for request in server.incoming_requests() {
        let ctx = Arc::clone(ctx);
        if is_watch(&request) && !is_shutdown() {
            let spawned = thread::Builder::new()
                .name("watch".into())
                .spawn(move || {
                    if let Err(e) = stream::serve_watch(request, &ctx.hub, ctx.keepalive) {
                        log!("serve"; "watch error: {e:#}");
                    }
                });
            if let Err(e) = spawned {
                log!("serve"; "failed to spawn watch thread: {e}");
            }
            continue;
        }

        pool.spawn(move || {
            if let Err(e) = handle_request(request, &ctx) {
                log!("serve"; "request error: {e:#}");
            }
        });
    }
    Ok(())
}

fn is_watch(request: &Request) -> bool {
    request.method() == &Method::Post && path::url_path(request.url()) == "/_events/watch"
}

/// Handle a single short HTTP request
fn handle_request(request: Request, ctx: &ServeContext) -> Result<()> {
    if is_shutdown() {
        return response::respond_unavailable(request);
    }

    let url = path::url_path(request.url()).to_string();
    debug!("serve"; "{} {}", request.method(), url);

    match (request.method(), url.as_str()) {
        (Method::Get | Method::Head, embed::CLIENT_JS_PATH) => {
            response::respond_client_js(request)
        }
        (Method::Post, "/_events/sub") => handle_sub(request, ctx),
        (Method::Post, "/_events/vote") => handle_vote(request, ctx),
        (Method::Post, "/_events/terminate") => handle_terminate(request),
        (_, "/_events/watch" | "/_events/sub" | "/_events/vote" | "/_events/terminate") => {
            response::respond_method_not_allowed(request)
        }
        (Method::Get | Method::Head, _) => serve_static(request, ctx),
        _ => response::respond_method_not_allowed(request),
    }
}

/// Serve a file from the current build. The build's read lock is held
/// while resolving and reading, never while sending.
fn serve_static(request: Request, ctx: &ServeContext) -> Result<()> {
    enum Found {
        File(&'static str, Vec<u8>),
        NotFound(Option<Vec<u8>>),
        NoBuild,
    }

    let found = {
        let current = ctx.builds.read();
        match current.as_ref() {
            None => Found::NoBuild,
            Some(build) => match path::resolve_path(request.url(), &build.path) {
                Some(file) => {
                    let (content_type, body) = response::read_file(&file)?;
                    Found::File(content_type, body)
                }
                None => Found::NotFound(std::fs::read(build.path.join("404.html")).ok()),
            },
        }
    };

    match found {
        Found::File(content_type, body) => response::respond_loaded(request, content_type, body),
        Found::NotFound(custom) => response::respond_not_found(request, custom),
        Found::NoBuild => response::respond_no_build(request),
    }
}

fn handle_sub(mut request: Request, ctx: &ServeContext) -> Result<()> {
    let rctx = request_context(&request);
    let body: SubRequest = match read_json(&mut request) {
        Ok(body) => body,
        Err(e) => return response::respond_error(request, 400, &e.to_string()),
    };

    let result = ctx.hub.watcher(&body.sid).and_then(|watcher| {
        ctx.hub.unwatch(&watcher, &body.remove);
        ctx.hub.watch(&watcher, &body.add, &rctx)
    });
    match result {
        Ok(failed) => response::respond_json(request, 200, &SubResult { failed }),
        Err(e @ EventError::NotFound) => response::respond_error(request, 404, &e.to_string()),
        Err(e) => response::respond_error(request, 500, &e.to_string()),
    }
}

fn handle_vote(mut request: Request, ctx: &ServeContext) -> Result<()> {
    let rctx = request_context(&request);
    let body: VoteRequest = match read_json(&mut request) {
        Ok(body) => body,
        Err(e) => return response::respond_error(request, 400, &e.to_string()),
    };

    let desc = json!({"name": "poll", "origin": body.origin, "id": body.id});
    let (origin, id) = match Descriptor::from_request(&desc, &rctx) {
        Ok(Descriptor::Poll { origin, id }) => (origin, id),
        Ok(_) => return response::respond_error(request, 400, "not a poll"),
        Err(e @ EventError::Forbidden(_)) => {
            return response::respond_error(request, 403, &e.to_string());
        }
        Err(e) => return response::respond_error(request, 400, &e.to_string()),
    };
    for (field, value) in [("voter", &body.voter), ("answer", &body.answer)] {
        if value.is_empty() || value.len() > MAX_VOTE_FIELD {
            let message = format!("{field} must be 1-{MAX_VOTE_FIELD} bytes");
            return response::respond_error(request, 400, &message);
        }
    }

    let recorded = ctx.store.connect().and_then(|mut conn| {
        let mut txn = ctx.store.transaction(&mut conn)?;
        polls::vote(&mut txn, &origin, &id, &body.voter, &body.answer)?;
        txn.commit()
    });
    match recorded {
        Ok(()) => response::respond_json(request, 200, &json!({})),
        Err(e) => {
            log!("serve"; "vote failed: {}", e);
            response::respond_error(request, 500, "vote not recorded")
        }
    }
}

fn handle_terminate(request: Request) -> Result<()> {
    let loopback = request
        .remote_addr()
        .is_some_and(|addr| addr.ip().is_loopback());
    if !loopback {
        return response::respond_error(request, 403, "terminate is only allowed from loopback");
    }

    response::respond_json(request, 200, &json!({}))?;
    request_shutdown(0, "terminate requested");
    Ok(())
}

/// Facts about the requesting page used for authorization.
fn request_context(request: &Request) -> RequestContext {
    let referer_path = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Referer"))
        .and_then(|h| path::referer_path(h.value.as_str()));
    RequestContext { referer_path }
}

/// Read and parse a JSON body of at most [`MAX_BODY`] bytes.
fn read_json<T: DeserializeOwned>(request: &mut Request) -> Result<T> {
    let mut body = Vec::new();
    request
        .as_reader()
        .take(MAX_BODY + 1)
        .read_to_end(&mut body)
        .context("failed to read request body")?;
    if body.len() as u64 > MAX_BODY {
        anyhow::bail!("request body too large");
    }
    serde_json::from_slice(&body).context("invalid JSON body")
}
