//! The device endpoint: HTTP/1.1 routes mapped onto the engine.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, Limited};
use hyper::{
    body::{Body, Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Notify};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::engine::Engine;
use crate::error::Error;

pub const DEFAULT_LIMIT: usize = 64 << 20;

/// Largest request body and largest status read served in one call.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_write: usize,
    pub max_read: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits { max_write: DEFAULT_LIMIT, max_read: DEFAULT_LIMIT }
    }
}

/// What `GET /instance` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub device: String,
    pub generation: u64,
    /// Largest write and read served in one request.
    pub max_write: usize,
    pub max_read: usize,
}

pub struct App {
    pub engine: Arc<Engine>,
    pub device: String,
    pub limits: Limits,
    /// Fired once to stop serving and hand the store over.
    pub upgrade: Arc<Notify>,
}

impl App {
    pub fn new(engine: Arc<Engine>, device: impl Into<String>, limits: Limits) -> Self {
        App { engine, device: device.into(), limits, upgrade: Arc::new(Notify::new()) }
    }
}

/// Serve connections until an upgrade is requested, then drain: stop accepting, let in-flight
/// requests finish and close every connection.
pub async fn serve(listener: TcpListener, app: Arc<App>) {
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        match accept_backoff(&err) {
                            None => debug!("accept failed: {}", err),
                            Some(pause) => {
                                error!("accept failed, pausing {:?}: {}", pause, err);
                                tokio::time::sleep(pause).await;
                            }
                        }
                        continue;
                    }
                };
                debug!(%peer, "connection opened");

                let io = TokioIo::new(stream);
                let app = app.clone();
                let conn = http1::Builder::new()
                    .serve_connection(io, service_fn(move |req| {
                        let app = app.clone();
                        async move {
                            handle(app, req).await
                        }
                    }));
                let conn = graceful.watch(conn);
                tokio::task::spawn(async move {
                    if let Err(err) = conn.await {
                        warn!(%peer, "error serving connection: {:?}", err);
                    }
                    debug!(%peer, "connection closed");
                });
            }
            _ = app.upgrade.notified() => {
                info!("upgrade requested, draining connections");
                break;
            }
        }
    }

    drop(listener);
    graceful.shutdown().await;
    info!("all connections drained");
}

// Errors about one half-open connection are retried at once; anything else (out of file
// descriptors, out of memory) gets a pause so the loop does not spin.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => None,
        _ => Some(Duration::from_secs(1)),
    }
}

pub async fn handle(app: Arc<App>, req: Request<Incoming>)
    -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
{
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/ping") => {
            Ok(Response::new(full("pong")))
        }
        (&Method::GET, "/instance") => {
            let instance = Instance {
                device: app.device.clone(),
                generation: app.engine.generation(),
                max_write: app.limits.max_write,
                max_read: app.limits.max_read,
            };
            match serde_json::to_vec(&instance) {
                Ok(body) => Ok(Response::new(full(body))),
                Err(e) => Ok(error_response(&e.into())),
            }
        }
        (&Method::POST, "/control") => {
            let body = match collect(req, app.limits.max_write).await? {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            let commands: Vec<Command> = match serde_json::from_slice(&body) {
                Ok(commands) => commands,
                Err(e) => return Ok(error_response(&e.into())),
            };
            match app.engine.control_all(&commands) {
                Ok(()) => Ok(no_content()),
                Err(e) => {
                    debug!("control rejected: {}", e);
                    Ok(error_response(&e))
                }
            }
        }
        (&Method::POST, "/ioctl") => {
            let request = match query(&req).get("request").map(|r| parse_request(r)) {
                Some(Some(request)) => request,
                _ => return Ok(status(StatusCode::BAD_REQUEST, "Missing or invalid request parameter")),
            };
            let arg = match collect(req, app.limits.max_write).await? {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            let result = Command::from_ioctl(request, &arg)
                .and_then(|command| app.engine.control(&command));
            match result {
                Ok(()) => Ok(no_content()),
                Err(e) => {
                    debug!("ioctl {:#010x} rejected: {}", request, e);
                    Ok(error_response(&e))
                }
            }
        }
        (&Method::POST, "/data") => {
            let body = match collect(req, app.limits.max_write).await? {
                Ok(body) => body,
                Err(resp) => return Ok(resp),
            };
            let written = app.engine.write(&body);
            Ok(Response::new(full(written.to_string())))
        }
        (&Method::GET, "/data") => {
            let n: usize = match query(&req).get("n").and_then(|n| n.parse().ok()) {
                Some(n) => n,
                None => return Ok(status(StatusCode::BAD_REQUEST, "Missing or invalid n parameter")),
            };
            if n > app.limits.max_read {
                return Ok(status(StatusCode::PAYLOAD_TOO_LARGE, n.to_string()));
            }
            Ok(Response::new(full(app.engine.read(n))))
        }
        (&Method::POST, "/update") => {
            app.upgrade.notify_one();
            Ok(status(StatusCode::ACCEPTED, "Upgrade started"))
        }
        _ => {
            let mut not_found = Response::new(empty());
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

fn query(req: &Request<Incoming>) -> HashMap<String, String> {
    let query = req.uri().query().unwrap_or("");
    url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

/// Accepts `0x`-prefixed hex or decimal.
fn parse_request(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

// Collect at most `limit` bytes of the body. The inner `Err` is a ready-made refusal.
async fn collect(req: Request<Incoming>, limit: usize)
    -> Result<Result<Bytes, Response<BoxBody<Bytes, hyper::Error>>>, hyper::Error>
{
    // Protect our server from massive bodies.
    if req.body().size_hint().lower() > limit as u64 {
        return Ok(Err(status(StatusCode::PAYLOAD_TOO_LARGE, "Body too big")));
    }
    match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => Ok(Ok(collected.to_bytes())),
        Err(err) => match err.downcast::<hyper::Error>() {
            Ok(err) => Err(*err),
            Err(_) => Ok(Err(status(StatusCode::PAYLOAD_TOO_LARGE, "Body too big"))),
        },
    }
}

fn error_response(err: &Error) -> Response<BoxBody<Bytes, hyper::Error>> {
    match err {
        Error::OutOfRange(value) => status(StatusCode::UNPROCESSABLE_ENTITY, value.to_string()),
        Error::NotSupported(what) => status(StatusCode::NOT_IMPLEMENTED, what.clone()),
        Error::Json(_) | Error::Io(_) => status(StatusCode::BAD_REQUEST, err.to_string()),
        _ => status(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn status<T: Into<Bytes>>(code: StatusCode, message: T) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(message));
    *resp.status_mut() = code;
    resp
}

fn no_content() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::NO_CONTENT;
    resp
}

// We create some utility functions to make Empty and Full bodies
// fit our broadened Response body type.
fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
