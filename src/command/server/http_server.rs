use std::convert::Infallible;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use opentelemetry::trace::TraceContextExt;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::pin;
use tracing::{debug, error, info, instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::command::server::auth::PeerCertificate;
use crate::command::server::error::Error;
use crate::command::server::review::review;
use crate::command::server::token_review::TokenReview;
use crate::command::server::ServerContext;
use crate::metrics_provider::{METRICS_PROVIDER, TOKEN_REVIEWS_HANDLER};

const MAX_BODY_SIZE: usize = 1024 * 1024;

pub async fn serve_request<S>(
    stream: TokioIo<S>,
    context: Arc<ServerContext>,
    peer_certificate: Option<Vec<u8>>,
    timeouts: Arc<[Duration; 2]>,
    remote_address: std::net::SocketAddr,
) where
    S: Unpin + AsyncWrite + AsyncRead + Send + Debug + 'static,
{
    let peer_certificate = peer_certificate.map(|cert| PeerCertificate(Arc::new(cert)));
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(
        stream,
        service_fn(move |mut request| {
            if let Some(ref peer_certificate) = peer_certificate {
                request.extensions_mut().insert(peer_certificate.clone());
            }
            request.extensions_mut().insert(remote_address);
            handle_request(Arc::clone(&context), request)
        }),
    );
    pin!(conn);

    for (iter, sleep_duration) in timeouts.iter().enumerate() {
        debug!("iter = {iter} sleep_duration = {sleep_duration:?}");
        tokio::select! {
            res = conn.as_mut() => {
                match res {
                    Ok(()) => debug!("after polling conn, no error"),
                    Err(error) =>  debug!("error serving connection: {error}"),
                }
                break;
            }
            () = tokio::time::sleep(*sleep_duration) => {
                debug!("iter = {iter} got timeout_interval, calling conn.graceful_shutdown");
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

#[instrument(skip(context, request))]
async fn handle_request(
    context: Arc<ServerContext>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let start_time = Instant::now();
    let method = request.method().to_owned();
    let path = request.uri().path().to_owned();

    let trace_id = {
        let context = Span::current().context();
        let span = context.span();
        let span_context = span.span_context();
        if span_context.is_valid() {
            Some(span_context.trace_id().to_string())
        } else {
            None
        }
    };

    let response = match router(&context, request).await {
        Ok(response) => response,
        Err(error) => error_to_response(&error),
    };

    let elapsed = start_time.elapsed();
    let status = response.status();

    let log = if let Some(trace_id) = trace_id {
        format!("{trace_id} {elapsed:?} - {status} {method} {path}")
    } else {
        format!("{elapsed:?} - {status} {method} {path}")
    };

    if status.is_server_error() {
        error!("{log}");
    } else {
        info!("{log}");
    }

    Ok(response)
}

async fn router(
    context: &ServerContext,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Error> {
    match (request.method(), request.uri().path()) {
        (&Method::POST, "/tokenreviews") => Ok(handle_token_review(context, request).await),
        (&Method::GET, "/healthz") => handle_healthz(),
        (&Method::GET, "/metrics") => handle_metrics(),
        (method, path) => Ok(handle_unknown_route(method, path)),
    }
}

#[instrument(skip(context, request))]
async fn handle_token_review(
    context: &ServerContext,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let method = request.method().as_str().to_lowercase();
    measured(&method, token_review_response(context, request)).await
}

/// Tracks `handle` in the in-flight gauge and records the request counter,
/// duration and size for every outcome, errors included.
async fn measured<F>(method: &str, handle: F) -> Response<Full<Bytes>>
where
    F: Future<Output = Result<Response<Full<Bytes>>, Error>>,
{
    let metrics = &*METRICS_PROVIDER;
    let start_time = Instant::now();

    metrics.metric_http_request_in_flight.inc();
    let response = handle.await.unwrap_or_else(|error| error_to_response(&error));
    metrics.metric_http_request_in_flight.dec();

    #[allow(clippy::cast_precision_loss)]
    let size = body_size(&response) as f64;
    metrics
        .metric_http_request_total
        .with_label_values(&[response.status().as_str(), method])
        .inc();
    metrics
        .metric_http_request_duration
        .with_label_values(&[TOKEN_REVIEWS_HANDLER, method])
        .observe(start_time.elapsed().as_secs_f64());
    metrics
        .metric_http_response_size
        .with_label_values(&[TOKEN_REVIEWS_HANDLER])
        .observe(size);

    response
}

async fn token_review_response(
    context: &ServerContext,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Error> {
    let peer_certificate = request.extensions().get::<PeerCertificate>().cloned();
    let body = read_body(request.into_body(), context.read_timeout).await;

    let (status, review) = match body {
        Ok(body) => review(context, peer_certificate.as_ref(), &body).await,
        Err(error) => (
            error.status_code(),
            TokenReview::failed(&error),
        ),
    };

    json_response(status, &review)
}

async fn read_body(body: Incoming, read_timeout: Duration) -> Result<Bytes, Error> {
    let collect = Limited::new(body, MAX_BODY_SIZE).collect();

    match tokio::time::timeout(read_timeout, collect).await {
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
        Ok(Err(error)) => Err(Error::MalformedRequest(format!(
            "Failed to parse request: {error}"
        ))),
        Err(_) => Err(Error::MalformedRequest(
            "Failed to parse request: timed out reading body".to_string(),
        )),
    }
}

fn handle_healthz() -> Result<Response<Full<Bytes>>, Error> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

fn handle_metrics() -> Result<Response<Full<Bytes>>, Error> {
    let (content_type, metrics) = METRICS_PROVIDER.gather()?;
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(metrics)))
        .map_err(|e| Error::Internal(format!("Failed to build metrics response: {e}")))
}

fn handle_unknown_route(method: &Method, path: &str) -> Response<Full<Bytes>> {
    let msg = format!("unknown route: {method} {path}");
    plain_json(StatusCode::NOT_FOUND, json!({ "error": msg }).to_string())
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Full<Bytes>>, Error> {
    let body = serde_json::to_vec(body)?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| Error::Internal(format!("Failed to build response: {e}")))
}

pub fn error_to_response(error: &Error) -> Response<Full<Bytes>> {
    plain_json(error.status_code(), json!({ "error": error.to_string() }).to_string())
}

fn plain_json(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
        .headers_mut()
        .insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

fn body_size(response: &Response<Full<Bytes>>) -> u64 {
    hyper::body::Body::size_hint(response.body())
        .exact()
        .unwrap_or_default()
}
