//! Lifecycle supervisor: accept loop plus the
//! `Starting -> Running -> Draining -> Stopped` state machine driving
//! graceful shutdown.
//!
//! The accept loop is a connection-per-task pattern (`TokioIo` +
//! `http1::Builder` + `service_fn`), wired through
//! `hyper_util::server::graceful::GracefulShutdown` so in-flight connections
//! finish before the process exits. The state machine is kept as a small,
//! directly-drivable type independent of the actual OS signal wiring, so its
//! transitions are unit-testable without ever raising a real signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::health::HealthStatus;
use crate::proxy::{self, ProxyContext};

/// Coarse process state, advancing monotonically left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Drives the process through its lifecycle and fans a single shutdown
/// signal out to every listener (proxy, health, pprof) sharing it.
#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<Mutex<LifecycleState>>,
    health: HealthStatus,
    shutdown: CancellationToken,
    force_stop: CancellationToken,
}

impl Lifecycle {
    pub fn new(health: HealthStatus) -> Self {
        Self {
            state: Arc::new(Mutex::new(LifecycleState::Starting)),
            health,
            shutdown: CancellationToken::new(),
            force_stop: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// A token every listener can watch to know when to stop accepting.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A token [`run`] races its drain deadline against: cancelled once
    /// draining should end immediately rather than finish gracefully.
    pub fn force_stop_token(&self) -> CancellationToken {
        self.force_stop.clone()
    }

    /// Severs the drain immediately. Idempotent, like the token it cancels.
    pub fn force_stop(&self) {
        self.force_stop.cancel();
    }

    /// `Starting -> Running`, once listeners are bound and serving.
    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Starting {
            *state = LifecycleState::Running;
        }
    }

    /// `Running -> Draining`: flips health to unhealthy and cancels the
    /// shared shutdown token. Returns `true` the first time this fires for a
    /// given process, `false` on any later call (e.g. a second signal),
    /// since the transition itself is not repeatable.
    pub fn begin_draining(&self) -> bool {
        let mut state = self.state.lock();
        if *state == LifecycleState::Running || *state == LifecycleState::Starting {
            *state = LifecycleState::Draining;
            drop(state);
            self.health.mark_draining();
            self.shutdown.cancel();
            true
        } else {
            false
        }
    }

    /// `* -> Stopped`, the terminal state. Idempotent.
    pub fn mark_stopped(&self) {
        *self.state.lock() = LifecycleState::Stopped;
    }
}

/// Duplicates `stream`'s underlying socket (`dup()`, via `into_std` +
/// `try_clone`) so a disconnect watcher can peek at the connection without
/// taking reads away from the handle hyper serves the connection on — both
/// handles share one OS socket and its `O_NONBLOCK` state.
fn prepare_stream(stream: TcpStream) -> std::io::Result<(TcpStream, TcpStream)> {
    let std_stream = stream.into_std()?;
    let watcher_std = std_stream.try_clone()?;
    std_stream.set_nonblocking(true)?;
    watcher_std.set_nonblocking(true)?;
    Ok((TcpStream::from_std(std_stream)?, TcpStream::from_std(watcher_std)?))
}

/// Cancels `token` the moment the client closes (`Ok(0)` from a
/// non-consuming peek) or resets the connection, so a request whose client
/// is already gone doesn't carry an in-flight forward to completion for
/// nobody. Returns without cancelling if `token` is already cancelled for
/// another reason (e.g. process shutdown) first.
async fn watch_disconnect(watcher: TcpStream, token: CancellationToken) {
    let mut buf = [0u8; 1];
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = watcher.peek(&mut buf) => match result {
                Ok(0) | Err(_) => {
                    token.cancel();
                    return;
                }
                // Pipelined bytes sitting unread; not a disconnect, but
                // peeking again immediately would busy-loop.
                Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            },
        }
    }
}

/// Runs the proxy accept loop on `listener` until shutdown, draining
/// in-flight connections for up to `shutdown_timeout` before forcing them
/// closed.
pub async fn run(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    lifecycle: Lifecycle,
    shutdown_timeout: Duration,
    max_header_bytes: usize,
) -> std::io::Result<()> {
    let graceful = GracefulShutdown::new();
    let shutdown = lifecycle.shutdown_token();
    let force_stop = lifecycle.force_stop_token();
    lifecycle.mark_running();

    info!(addr = %listener.local_addr()?, "proxy listening");

    let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let (io_stream, watcher_stream) = match prepare_stream(stream) {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, %addr, "failed to prepare accepted socket for disconnect watching");
                        continue;
                    }
                };
                let io = TokioIo::new(io_stream);
                let ctx = ctx.clone();

                let disconnect = CancellationToken::new();
                let watcher_handle = tokio::spawn(watch_disconnect(watcher_stream, disconnect.clone()));

                let svc = service_fn({
                    let disconnect = disconnect.clone();
                    move |mut req| {
                        let ctx = ctx.clone();
                        req.extensions_mut().insert(addr);
                        req.extensions_mut().insert(disconnect.clone());
                        async move { proxy::handle(req, ctx).await }
                    }
                });

                let conn = http1::Builder::new()
                    .max_buf_size(max_header_bytes.max(8192))
                    .serve_connection(io, svc)
                    .with_upgrades();
                let conn = graceful.watch(conn);
                let handle = tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        error!(error = %err, "connection error");
                    }
                    // The connection is done either way; stop watching and
                    // release the per-request token so it can't outlive it.
                    disconnect.cancel();
                    watcher_handle.abort();
                });
                connections.lock().push(handle);
            }
            _ = shutdown.cancelled() => break,
        }
    }

    // A second shutdown signal and the drain deadline race against the
    // graceful drain itself; whichever fires first severs every connection
    // still tracked in `connections` rather than letting it finish.
    tokio::select! {
        result = tokio::time::timeout(shutdown_timeout, graceful.shutdown()) => {
            match result {
                Ok(()) => info!("proxy drained all in-flight connections"),
                Err(_) => {
                    warn!(timeout = ?shutdown_timeout, "drain deadline elapsed, forcing connections closed");
                    abort_all(&connections);
                }
            }
        }
        _ = force_stop.cancelled() => {
            warn!("second shutdown signal received, forcing connections closed");
            abort_all(&connections);
        }
    }

    lifecycle.mark_stopped();
    Ok(())
}

fn abort_all(connections: &Mutex<Vec<JoinHandle<()>>>) {
    for handle in connections.lock().drain(..) {
        handle.abort();
    }
}

/// Waits for the process to be asked to stop (SIGINT/SIGTERM, or Ctrl-C on
/// platforms with no POSIX signals) and drives `lifecycle` into draining. A
/// second signal forces [`run`] to stop draining and sever connections
/// immediately via [`Lifecycle::force_stop`].
pub async fn watch_for_shutdown(lifecycle: Lifecycle) {
    wait_for_signal().await;
    if lifecycle.begin_draining() {
        info!("shutdown signal received, draining");
    }
    wait_for_signal().await;
    warn!("second shutdown signal received, forcing connections closed");
    lifecycle.force_stop();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Binds the optional health/pprof side listener bound to `addr`, logging
/// and returning on bind failure rather than panicking the process.
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;

    #[tokio::test]
    async fn watch_disconnect_cancels_when_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        let (_io_stream, watcher_stream) = prepare_stream(server_stream).unwrap();

        let token = CancellationToken::new();
        let watcher = tokio::spawn(watch_disconnect(watcher_stream, token.clone()));

        drop(client);

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should be cancelled promptly after the peer closes");
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn watch_disconnect_returns_without_cancelling_on_external_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        let (_io_stream, watcher_stream) = prepare_stream(server_stream).unwrap();

        let token = CancellationToken::new();
        let watcher = tokio::spawn(watch_disconnect(watcher_stream, token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher should exit promptly once its token is cancelled")
            .unwrap();
    }

    #[test]
    fn starts_in_starting_state() {
        let lifecycle = Lifecycle::new(HealthStatus::new());
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
    }

    #[test]
    fn mark_running_advances_from_starting() {
        let lifecycle = Lifecycle::new(HealthStatus::new());
        lifecycle.mark_running();
        assert_eq!(lifecycle.state(), LifecycleState::Running);
    }

    #[test]
    fn begin_draining_flips_health_and_cancels_token() {
        let health = HealthStatus::new();
        let lifecycle = Lifecycle::new(health.clone());
        lifecycle.mark_running();

        let token = lifecycle.shutdown_token();
        assert!(!token.is_cancelled());

        let fired = lifecycle.begin_draining();
        assert!(fired);
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
        assert!(!health.is_healthy());
        assert!(token.is_cancelled());
    }

    #[test]
    fn second_draining_call_is_a_no_op() {
        let lifecycle = Lifecycle::new(HealthStatus::new());
        lifecycle.mark_running();
        assert!(lifecycle.begin_draining());
        assert!(!lifecycle.begin_draining());
    }

    #[test]
    fn force_stop_cancels_its_token() {
        let lifecycle = Lifecycle::new(HealthStatus::new());
        let token = lifecycle.force_stop_token();
        assert!(!token.is_cancelled());
        lifecycle.force_stop();
        assert!(token.is_cancelled());
    }

    #[test]
    fn mark_stopped_is_terminal() {
        let lifecycle = Lifecycle::new(HealthStatus::new());
        lifecycle.mark_running();
        lifecycle.begin_draining();
        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }
}
