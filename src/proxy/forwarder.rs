// src/proxy/forwarder.rs
// Byte relay for one accepted connection.
use super::backend::ConnectionGuard;
use crate::context::ProxyContext;
use crate::error::TransportError;
use crate::metrics::RequestRecord;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const BUFFER_SIZE: usize = 4096;

/// How long a single read or write waits before re-checking the close flag.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    BackendSelected,
    ConnectedToBackend,
    Relaying,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::BackendSelected => "backend_selected",
            ConnectionState::ConnectedToBackend => "connected_to_backend",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Bytes moved in each direction and whether the relay ended cleanly.
#[derive(Debug, Default)]
pub struct RelayTotals {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub error: Option<String>,
}

pub struct Forwarder {
    ctx: Arc<ProxyContext>,
}

impl Forwarder {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Drive one connection from ACCEPTED to CLOSED. Never returns an
    /// error: every failure ends in CLOSED and is accounted for.
    pub async fn handle<S>(&self, client: S, peer: SocketAddr) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        let mut state = ConnectionState::Accepted;
        debug!(%peer, %state, "connection");

        let Some(backend) = self.ctx.select_backend() else {
            warn!(%peer, "No healthy backend available, closing connection");
            self.finish(peer, &mut state, RequestRecord {
                success: false,
                elapsed: started.elapsed(),
                ..Default::default()
            });
            return state;
        };

        let guard = ConnectionGuard::acquire(backend.clone());
        transition(&mut state, ConnectionState::BackendSelected, peer);

        let upstream = match connect(backend.authority(), self.ctx.config.timeouts.connect()).await {
            Ok(stream) => stream,
            Err(e) => {
                // Counted as a failed connection only; backend health is
                // owned by the health checker's next sweep.
                warn!(%peer, backend = %backend.id, "Backend connect failed: {}", e);
                guard.release();
                self.finish(peer, &mut state, RequestRecord {
                    success: false,
                    elapsed: started.elapsed(),
                    ..Default::default()
                });
                return state;
            }
        };
        transition(&mut state, ConnectionState::ConnectedToBackend, peer);
        info!(%peer, backend = %backend.id, "Connected client to backend");

        transition(&mut state, ConnectionState::Relaying, peer);
        self.ctx.metrics.increment_active_connections();
        let totals = relay(client, upstream, self.ctx.config.server.idle_timeout()).await;
        self.ctx.metrics.decrement_active_connections();
        guard.release();

        if let Some(e) = &totals.error {
            debug!(%peer, backend = %backend.id, "Relay ended with error: {}", e);
        }

        self.finish(peer, &mut state, RequestRecord {
            success: totals.error.is_none(),
            bytes_in: totals.client_to_backend,
            bytes_out: totals.backend_to_client,
            elapsed: started.elapsed(),
        });
        state
    }

    fn finish(&self, peer: SocketAddr, state: &mut ConnectionState, record: RequestRecord) {
        transition(state, ConnectionState::Closed, peer);
        self.ctx.stats.record(record);
        self.ctx.metrics.record_request(
            "tcp",
            if record.success { "success" } else { "failure" },
            record.bytes_in,
            record.bytes_out,
            record.elapsed,
        );
        info!(
            %peer,
            bytes_in = record.bytes_in,
            bytes_out = record.bytes_out,
            "Connection closed"
        );
    }
}

fn transition(state: &mut ConnectionState, next: ConnectionState, peer: SocketAddr) {
    debug!(%peer, from = %state, to = %next, "connection state");
    *state = next;
}

async fn connect(authority: &str, limit: Duration) -> Result<TcpStream, TransportError> {
    let stream = timeout(limit, TcpStream::connect(authority))
        .await
        .map_err(|_| TransportError::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Last time either direction moved data, in millis since `origin`.
struct Activity {
    origin: Instant,
    last: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last.load(Ordering::Relaxed)))
    }
}

/// Relay both directions until either side closes, errors, or the
/// connection sits idle for `idle_timeout`.
pub async fn relay<C, B>(client: C, backend: B, idle_timeout: Duration) -> RelayTotals
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let closed = AtomicBool::new(false);
    let activity = Activity::new();

    let (upstream, downstream) = tokio::join!(
        pump(client_read, backend_write, &closed, &activity, idle_timeout),
        pump(backend_read, client_write, &closed, &activity, idle_timeout),
    );

    let mut totals = RelayTotals::default();
    match upstream {
        Ok(n) => totals.client_to_backend = n,
        Err((n, e)) => {
            totals.client_to_backend = n;
            totals.error = Some(format!("client -> backend: {}", e));
        }
    }
    match downstream {
        Ok(n) => totals.backend_to_client = n,
        Err((n, e)) => {
            totals.backend_to_client = n;
            totals.error.get_or_insert(format!("backend -> client: {}", e));
        }
    }
    totals
}

/// One direction: sequential read-then-write, so byte order holds.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    closed: &AtomicBool,
    activity: &Activity,
    idle_timeout: Duration,
) -> Result<u64, (u64, std::io::Error)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    let outcome = loop {
        if closed.load(Ordering::Acquire) {
            break Ok(());
        }

        match timeout(POLL_INTERVAL.min(idle_timeout), reader.read(&mut buf)).await {
            Err(_) => {
                if activity.idle_for() >= idle_timeout {
                    debug!("Idle timeout after {:?}", idle_timeout);
                    break Ok(());
                }
            }
            Ok(Ok(0)) => break Ok(()),
            Ok(Ok(n)) => {
                let written =
                    write_bounded(&mut writer, &buf[..n], closed, activity, idle_timeout).await;
                match written {
                    Ok(written) => {
                        total += written as u64;
                        if written < n {
                            break Ok(());
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
            Ok(Err(e)) => break Err(e),
        }
    };

    // Either side ending tears the whole connection down.
    closed.store(true, Ordering::Release);
    let _ = timeout(POLL_INTERVAL, writer.shutdown()).await;

    outcome.map(|_| total).map_err(|e| (total, e))
}

/// Write `data` in bounded waits. Returns early with the bytes written so
/// far once the connection is closed or the peer stops reading for
/// `idle_timeout`.
async fn write_bounded<W>(
    writer: &mut W,
    data: &[u8],
    closed: &AtomicBool,
    activity: &Activity,
    idle_timeout: Duration,
) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < data.len() {
        if closed.load(Ordering::Acquire) {
            break;
        }

        match timeout(POLL_INTERVAL.min(idle_timeout), writer.write(&data[written..])).await {
            Err(_) => {
                if activity.idle_for() >= idle_timeout {
                    debug!("Peer stopped reading for {:?}", idle_timeout);
                    break;
                }
            }
            Ok(Ok(0)) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => {
                written += n;
                activity.touch();
            }
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(written)
}
