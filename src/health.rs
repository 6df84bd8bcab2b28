//! Process-wide health status and its standalone listener: health starts at
//! 200, flips to 503 once draining begins, and never flips back — a
//! separate, minimal hyper service so liveness probes are unaffected by
//! load on the main proxy listener.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::body::ProxyBody;

/// Monotonic health flag: `Healthy -> Draining`, never the reverse.
#[derive(Clone, Default)]
pub struct HealthStatus(Arc<AtomicBool>);

impl HealthStatus {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Flips the process into draining. Idempotent.
    pub fn mark_draining(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn respond(
    _req: Request<hyper::body::Incoming>,
    status: HealthStatus,
) -> Result<Response<ProxyBody>, Infallible> {
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(Response::builder()
        .status(code)
        .body(ProxyBody::empty())
        .expect("static response parts are always valid"))
}

/// Serves the health endpoint on an already-bound `listener` until
/// `shutdown` is cancelled. Binding happens in the caller so a bad
/// `--bind-health-check` address is a fatal startup error, not a silent
/// background-task failure.
pub async fn serve(listener: TcpListener, status: HealthStatus, shutdown: CancellationToken) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "health endpoint listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let status = status.clone();

                tokio::spawn(async move {
                    let svc = service_fn(move |req| respond(req, status.clone()));
                    if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                        error!(error = %err, "health connection error");
                    }
                });
            }
        }
    }
}
