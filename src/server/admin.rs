// src/server/admin.rs
// Metrics exposition plus read-only JSON views of the engine.
use crate::engine::Engine;
use crate::error::EngineError;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub fn spawn(
    addr: SocketAddr,
    engine: Weak<Engine>,
    metrics_path: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, JoinHandle<()>), EngineError> {
    let metrics_path = Arc::new(metrics_path);
    let service_path = metrics_path.clone();

    let make_service = make_service_fn(move |_| {
        let engine = engine.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let engine = engine.clone();
                let path = path.clone();
                async move { Ok::<_, Infallible>(route(req, engine, &path).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);
    let bound = server.local_addr();

    let server = server.with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    });

    info!(
        "Admin server listening on http://{} (metrics at {})",
        bound,
        metrics_path.as_str()
    );

    let task = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Admin server error: {}", e);
        }
    });

    Ok((bound, task))
}

async fn route(req: Request<Body>, engine: Weak<Engine>, metrics_path: &str) -> Response<Body> {
    let Some(engine) = engine.upgrade() else {
        return text(StatusCode::SERVICE_UNAVAILABLE, "Engine stopped");
    };
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    match req.uri().path() {
        path if path == metrics_path => match engine.context().registry.gather() {
            Ok(buffer) => {
                let mut response = Response::new(Body::from(buffer));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                error!("Failed to gather metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Metrics unavailable")
            }
        },
        "/status" => json(&engine.status().await),
        "/targets" => json(&engine.list_targets().await),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn json<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec_pretty(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize admin response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed")
        }
    }
}

fn text(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}
