//! Reverse proxy forwarding requests to the backend over mTLS.
//!
//! Every request waits on the readiness gate, is forwarded with the internal
//! bearer token in place of the caller's authorization header, and has its
//! response streamed back frame by frame. A copy of each frame goes to a
//! separate accounting task, so token parsing never delays the caller.

use crate::backend::upstream_client;
use crate::context::AppContext;
use crate::events::ProxyEvent;
use crate::tokens::TokenAccountant;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body::Frame;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// Headers never forwarded upstream.
const STRIPPED_REQUEST_HEADERS: [HeaderName; 5] = [
    header::HOST,
    header::AUTHORIZATION,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
];

struct CachedClient {
    generation: u64,
    address: IpAddr,
    client: reqwest::Client,
}

/// Shared state for the proxy handler.
#[derive(Clone)]
pub struct ProxyState {
    ctx: Arc<AppContext>,
    client: Arc<Mutex<Option<CachedClient>>>,
}

impl ProxyState {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            client: Arc::new(Mutex::new(None)),
        }
    }

    /// Upstream client plus bearer token. The client is rebuilt whenever the
    /// TLS configuration is reloaded or the backend address changes.
    async fn upstream(&self) -> Result<Option<(reqwest::Client, String)>, Response> {
        let tls = self.ctx.credentials.client_tls().await.map_err(|e| {
            error!(error = %e, "Failed to load client credentials");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to load credentials: {}", e),
            )
        })?;
        let Some(address) = self.ctx.backend.cached_address() else {
            return Ok(None);
        };

        let mut cached = self.client.lock().await;
        if let Some(c) = cached.as_ref()
            && c.generation == tls.generation
            && c.address == address
        {
            return Ok(Some((c.client.clone(), tls.token)));
        }

        let client = upstream_client(
            &tls,
            &self.ctx.config.service_name,
            address,
            self.ctx.config.timing.upstream_timeout(),
        )
        .map_err(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to build upstream client: {}", e),
            )
        })?;
        debug!(%address, generation = tls.generation, "Built upstream client");
        *cached = Some(CachedClient {
            generation: tls.generation,
            address,
            client: client.clone(),
        });
        Ok(Some((client, tls.token)))
    }

    async fn drop_client(&self) {
        *self.client.lock().await = None;
    }
}

/// Router forwarding every method and path to the backend.
pub fn proxy_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .with_state(ProxyState::new(ctx))
}

/// Axum fallback handler that forwards requests to the backend.
pub async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response {
    let started = Instant::now();
    let ctx = Arc::clone(&state.ctx);
    let timing = &ctx.config.timing;

    let (parts, body) = req.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Failed to read body: {}", e));
        }
    };

    ctx.orchestrator.ensure_setup();
    if let Err(e) = ctx.orchestrator.wait_ready(timing.setup_timeout()).await {
        warn!(error = %e, %path, "Backend not available");
        record_request(&method, 503, started);
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("Backend not available: {}", e),
        );
    }

    let url = format!(
        "https://{}:{}{}",
        ctx.config.service_name, ctx.config.backend_port, path_and_query
    );
    let mut headers = parts.headers;
    for name in &STRIPPED_REQUEST_HEADERS {
        headers.remove(name);
    }

    let attempts = timing.retry_attempts.max(1);
    let mut recovered = false;
    for attempt in 1..=attempts {
        let upstream = match state.upstream().await {
            Ok(u) => u,
            Err(response) => {
                record_request(&method, 500, started);
                return response;
            }
        };

        if let Some((client, token)) = upstream {
            let result = client
                .request(method.clone(), &url)
                .headers(headers.clone())
                .bearer_auth(&token)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().as_u16() != ctx.config.not_ready_status => {
                    if attempt > 1 {
                        info!(attempt, %path, "Upstream answered after retry");
                    }
                    return stream_response(&ctx, response, method, path, started);
                }
                Ok(response) => {
                    debug!(attempt, status = %response.status(), "Upstream not ready");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Upstream request failed");
                }
            }
        }

        if attempt == attempts {
            break;
        }
        metrics::counter!("llmgate_upstream_retries_total").increment(1);

        if !recovered {
            // One full recovery pass per request, then plain retries
            recovered = true;
            state.drop_client().await;
            ctx.orchestrator.request_recovery();
            if let Err(e) = ctx.orchestrator.wait_ready(timing.setup_timeout()).await {
                warn!(error = %e, %path, "Recovery failed");
                record_request(&method, 503, started);
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &format!("Backend not available: {}", e),
                );
            }
        } else {
            tokio::time::sleep(timing.retry_interval()).await;
        }
    }

    error!(%path, attempts, "Upstream unreachable after all retries");
    record_request(&method, 502, started);
    error_response(
        StatusCode::BAD_GATEWAY,
        &format!("Backend unreachable after {} attempts", attempts),
    )
}

fn stream_response(
    ctx: &Arc<AppContext>,
    response: reqwest::Response,
    method: Method,
    path: String,
    started: Instant,
) -> Response {
    let status = response.status();
    let mut headers = HeaderMap::with_capacity(response.headers().len());
    for (name, value) in response.headers() {
        if name != header::TRANSFER_ENCODING && name != header::CONNECTION {
            headers.append(name, value.clone());
        }
    }

    let (tap, rx) = mpsc::unbounded_channel();
    let accountant = TokenAccountant::new(&path, Arc::clone(&ctx.totals));
    tokio::spawn(account(
        Arc::clone(ctx),
        rx,
        accountant,
        Completed {
            method,
            path,
            status: status.as_u16(),
            started,
        },
    ));

    let body = TeeBody {
        inner: Body::from_stream(response.bytes_stream()),
        tap: Some(tap),
    };
    let mut out = Response::new(Body::new(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

struct Completed {
    method: Method,
    path: String,
    status: u16,
    started: Instant,
}

/// Feed the duplicated body into the accountant, sampling the live rate
/// while it streams, then publish the request summary.
async fn account(
    ctx: Arc<AppContext>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut accountant: TokenAccountant,
    done: Completed,
) {
    let counters = accountant.counters();
    let sampling = accountant.dialect().is_some();
    let mut ticker = tokio::time::interval(ctx.config.timing.rate_sample());
    ticker.tick().await;

    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => accountant.feed(&chunk),
                None => break,
            },
            _ = ticker.tick(), if sampling => {
                if counters.output() > 0 {
                    ctx.events.emit(ProxyEvent::StreamingRate {
                        path: done.path.clone(),
                        output_tokens: counters.output(),
                        output_tok_per_sec: counters.output_rate(),
                    });
                }
            }
        }
    }
    accountant.finish();

    let (input_tokens, output_tokens) = accountant.counts();
    let output_tok_per_sec = counters.output_rate();
    let duration = done.started.elapsed();

    ctx.touch();
    ctx.heartbeat.ping();
    record_request(&done.method, done.status, done.started);

    info!(
        method = %done.method,
        path = %done.path,
        status = done.status,
        duration_ms = duration.as_millis() as u64,
        input_tokens,
        output_tokens,
        tok_per_sec = %format!("{:.1}", output_tok_per_sec),
        dialect = accountant.dialect().map(|d| d.as_str()).unwrap_or("none"),
        "Request completed"
    );
    ctx.events.emit(ProxyEvent::RequestCompleted {
        method: done.method.to_string(),
        path: done.path,
        status: done.status,
        duration,
        input_tokens,
        output_tokens,
        output_tok_per_sec,
    });
}

fn record_request(method: &Method, status: u16, started: Instant) {
    metrics::counter!(
        "llmgate_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("llmgate_request_duration_seconds").record(started.elapsed().as_secs_f64());
}

/// Response body that copies every data frame onto the accounting channel.
/// The channel closes when the body ends, errors or is dropped.
struct TeeBody {
    inner: Body,
    tap: Option<mpsc::UnboundedSender<Bytes>>,
}

impl http_body::Body for TeeBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(tap)) = (frame.data_ref(), &this.tap) {
                    let _ = tap.send(data.clone());
                }
            }
            Poll::Ready(_) => this.tap = None,
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "llmgate_error"
        }
    });
    (status, Json(body)).into_response()
}
