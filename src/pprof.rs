//! Optional CPU-profiling endpoint, feature-gated behind `pprof`.
//!
//! `GET /debug/pprof/profile?seconds=N` captures an N-second CPU profile
//! (default 10s) and returns it as a serialized `pprof` protobuf.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pprof::protos::Message;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::body::ProxyBody;

const DEFAULT_SECONDS: u64 = 10;
const MAX_SECONDS: u64 = 60;

async fn respond(req: Request<hyper::body::Incoming>) -> Result<Response<ProxyBody>, Infallible> {
    if req.uri().path() != "/debug/pprof/profile" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(ProxyBody::empty())
            .expect("static response parts are always valid"));
    }

    let seconds = req
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("seconds="))
        })
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_SECONDS)
        .clamp(1, MAX_SECONDS);

    match capture(seconds).await {
        Ok(bytes) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/octet-stream")
            .body(ProxyBody::from(bytes::Bytes::from(bytes)))
            .expect("static response parts are always valid")),
        Err(message) => {
            warn!(error = %message, "pprof capture failed");
            Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(ProxyBody::from(message))
                .expect("static response parts are always valid"))
        }
    }
}

async fn capture(seconds: u64) -> Result<Vec<u8>, String> {
    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(1000)
        .build()
        .map_err(|e| e.to_string())?;

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let report = guard.report().build().map_err(|e| e.to_string())?;
    let profile = report.pprof().map_err(|e| e.to_string())?;
    profile.write_to_bytes().map_err(|e| e.to_string())
}

/// Serves the profiling endpoint on `addr` until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "pprof endpoint listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    let svc = service_fn(respond);
                    if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                        error!(error = %err, "pprof connection error");
                    }
                });
            }
        }
    }
}
