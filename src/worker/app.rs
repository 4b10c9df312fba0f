//! Applications hosted by workers.
//!
//! The pool treats the application as opaque: it gets each accepted
//! connection plus the worker context and owns the bytes from there.
//! [`HelloApp`] is the default used by the `tidepool` binary.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::runtime::WorkerContext;
use crate::address::Connection;
use crate::error::Result;
use crate::metrics::{RequestSample, classify};

/// Largest request head [`HelloApp`] reads.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// A request-handling application.
pub trait Application: Send + Sync + 'static {
    /// Serve one connection.
    fn handle(
        &self,
        conn: Box<dyn Connection>,
        ctx: Arc<WorkerContext>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Minimal HTTP/1.x responder.
///
/// `GET /` answers `Hello World!`, `GET /metrics` answers the pool's metrics
/// snapshot as JSON, other methods get 405. Every response closes the
/// connection and is recorded in the shared metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct HelloApp;

impl Application for HelloApp {
    async fn handle(&self, mut conn: Box<dyn Connection>, ctx: Arc<WorkerContext>) -> Result<()> {
        let started = Instant::now();
        let head = read_head(&mut conn).await?;
        if head.is_empty() {
            return Ok(());
        }

        let request = RequestHead::parse(&head);
        let response = match &request {
            Some(req) if req.method != "GET" => Response::text(405, "Method Not Allowed"),
            Some(req) if req.path == "/" => Response::text(200, "Hello World!"),
            Some(req) if req.path == "/metrics" => {
                let snapshot = ctx.metrics_snapshot().await;
                Response::json(200, serde_json::to_vec(&snapshot)?)
            }
            Some(_) => Response::text(404, "Not Found"),
            None => Response::text(400, "Bad Request"),
        };

        let sample = RequestSample {
            status: response.status,
            agent: request
                .as_ref()
                .and_then(|r| r.user_agent.as_deref())
                .and_then(classify),
            latency: started.elapsed(),
        };
        if let Err(e) = ctx.record_request(&sample) {
            tracing::warn!(error = %e, "Failed to record request metrics");
        }

        conn.write_all(&response.to_bytes()).await?;
        conn.shutdown().await?;
        Ok(())
    }
}

/// Read until the end of the request head, EOF, or the size limit.
async fn read_head<R: AsyncRead + Unpin>(conn: &mut R) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head.len() >= MAX_HEAD_BYTES
            || head.windows(4).any(|w| w == b"\r\n\r\n")
            || head.windows(2).any(|w| w == b"\n\n")
        {
            break;
        }
    }
    Ok(head)
}

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    user_agent: Option<String>,
}

impl RequestHead {
    fn parse(head: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(head).ok()?;
        let mut lines = text.lines();

        let mut parts = lines.next()?.split_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        let version = parts.next()?;
        if !version.starts_with("HTTP/1.") || !target.starts_with('/') {
            return None;
        }
        let path = target.split(['?', '#']).next().unwrap_or(target);

        let user_agent = lines.take_while(|l| !l.is_empty()).find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("user-agent")
                .then(|| value.trim().to_string())
        });

        Some(Self {
            method: method.to_string(),
            path: path.to_string(),
            user_agent,
        })
    }
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    fn json(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "Unknown",
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}
