// src/server/builder.rs
// The accept loop: bounded concurrency, one task per connection.
use crate::config::RelayMode;
use crate::context::ProxyContext;
use crate::proxy::{Forwarder, HttpRelay};
use crate::server::handler::RequestHandler;
use hyper::server::conn::Http;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio_native_tls::TlsAcceptor;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct ServerBuilder {
    ctx: Arc<ProxyContext>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl ServerBuilder {
    pub fn new(ctx: Arc<ProxyContext>, listener: TcpListener) -> Self {
        Self {
            ctx,
            listener,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsAcceptor>) -> Self {
        self.tls = tls;
        self
    }

    /// Accept until shutdown is signalled. The listener is dropped when
    /// this returns; connections already dispatched drain on their own.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let Self { ctx, listener, tls } = self;
        let limit = Arc::new(Semaphore::new(ctx.config.server.max_connections));
        let mode = ctx.config.server.mode;

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, ?mode, tls = tls.is_some(), "Listening");
        }

        loop {
            let permit = tokio::select! {
                permit = limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };
            debug!(%peer, "Accepted connection");

            let ctx = ctx.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => dispatch(ctx, mode, stream, peer).await,
                        Err(e) => warn!(%peer, "TLS handshake failed: {}", e),
                    },
                    None => dispatch(ctx, mode, stream, peer).await,
                }
            });
        }

        info!("Listener closed");
    }
}

async fn dispatch<S>(ctx: Arc<ProxyContext>, mode: RelayMode, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match mode {
        RelayMode::Tcp => {
            Forwarder::new(ctx).handle(stream, peer).await;
        }
        RelayMode::Http => {
            let handler = RequestHandler::new(HttpRelay::new(ctx), peer);
            let mut http = Http::new();
            http.http1_only(true);
            if let Err(err) = http.serve_connection(stream, handler).await {
                // Includes writes to a client that hung up after the
                // backend answered.
                warn!(%peer, %err, "connection error");
            }
        }
    }
}
