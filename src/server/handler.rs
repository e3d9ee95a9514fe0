// src/server/handler.rs
use crate::proxy::HttpRelay;
use hyper::{Body, Request, Response};
use std::net::SocketAddr;
use tower::Service;

/// Per-connection service: remembers the client address so the relay
/// can fill in the forwarding headers.
#[derive(Clone)]
pub struct RequestHandler {
    relay: HttpRelay,
    peer: SocketAddr,
}

impl RequestHandler {
    pub fn new(relay: HttpRelay, peer: SocketAddr) -> Self {
        Self { relay, peer }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let relay = self.relay.clone();
        let peer = self.peer;
        // Relay failures are already synthetic responses.
        Box::pin(async move { Ok(relay.handle(req, peer).await) })
    }
}
