//! HTTP server for the relay
//!
//! `POST /api/new-id` issues a token, `POST /api/upload?id=` attaches the
//! request body as the sender, `GET /api/download?id=` streams it out to the
//! receiver.

use crate::error::RelayError;
use crate::relay::{CHUNK_SIZE, Coordinator};
use crate::session::ByteSource;
use crate::token::Token;
use anyhow::Result;
use axum::{
    Router,
    body::Body,
    extract::{DefaultBodyLimit, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, future, stream};
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

/// Static upload form
const UPLOAD_HTML: &str = include_str!("static/upload.html");

#[derive(Debug, Deserialize)]
struct TransferQuery {
    id: Option<String>,
}

impl TransferQuery {
    fn token(self) -> Option<Token> {
        self.id.filter(|id| !id.is_empty()).map(Token::from)
    }
}

fn error_response(status: StatusCode, err: &RelayError) -> Response {
    (status, err.to_string()).into_response()
}

fn missing_id() -> Response {
    (StatusCode::BAD_REQUEST, "Missing id parameter").into_response()
}

fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::UnknownToken => StatusCode::NOT_FOUND,
        RelayError::AlreadyAttached(_) => StatusCode::CONFLICT,
        RelayError::DuplicateToken
        | RelayError::TransferFailed(_)
        | RelayError::Cancelled(_)
        | RelayError::Expired => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn upload_page_handler() -> Html<&'static str> {
    Html(UPLOAD_HTML)
}

async fn not_found_handler() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

async fn new_id_handler(State(coordinator): State<Arc<Coordinator>>) -> Response {
    match coordinator.begin_transfer() {
        Ok(token) => token.to_string().into_response(),
        Err(e) => {
            tracing::error!("Failed to issue token: {}", e);
            error_response(status_for(&e), &e)
        }
    }
}

/// Holds the request open until the receiver has the whole body
async fn upload_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<TransferQuery>,
    body: Body,
) -> Response {
    let Some(token) = query.token() else {
        return missing_id();
    };

    let stream = body.into_data_stream().map_err(io::Error::other);
    let source: ByteSource = Box::pin(StreamReader::new(stream));

    match coordinator.attach_sender(&token, source).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(RelayError::UnknownToken) => {
            error_response(StatusCode::BAD_REQUEST, &RelayError::UnknownToken)
        }
        Err(e) => error_response(status_for(&e), &e),
    }
}

/// Waits for the sender before committing headers, then streams the body
async fn download_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<TransferQuery>,
) -> Response {
    let Some(token) = query.token() else {
        return missing_id();
    };

    let claim = match coordinator.claim_receiver(&token) {
        Ok(claim) => claim,
        Err(e) => return error_response(status_for(&e), &e),
    };
    if let Err(e) = claim.wait_for_sender().await {
        return error_response(status_for(&e), &e);
    }

    let (writer, reader) = tokio::io::duplex(CHUNK_SIZE);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = outcome_tx.send(claim.relay(writer).await);
    });

    let tail = stream::once(outcome_rx).filter_map(|outcome| future::ready(body_tail(outcome)));
    let body = Body::from_stream(ReaderStream::new(reader).chain(tail));

    (
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}

/// Map the relay outcome onto the end of the response body.
///
/// Headers are already sent, so a failure can only be surfaced by ending the
/// body with an error, which truncates the chunked response.
fn body_tail(
    outcome: Result<Result<u64, RelayError>, oneshot::error::RecvError>,
) -> Option<io::Result<Bytes>> {
    match outcome {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(Err(io::Error::other(e))),
        Err(_) => Some(Err(io::Error::other("relay task ended early"))),
    }
}

/// Middleware to add security headers
async fn add_security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'self'; style-src 'self' 'unsafe-inline'; script-src 'self' 'unsafe-inline'",
        ),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );

    response
}

/// Build the relay router
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/upload", get(upload_page_handler))
        .route("/api/new-id", post(new_id_handler))
        .route(
            "/api/upload",
            post(upload_handler).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/download", get(download_handler))
        .route("/download", get(download_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(add_security_headers))
        .with_state(coordinator)
}

/// Serve the relay on an already bound listener
pub async fn serve_listener(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    cancel_token: Option<CancellationToken>,
) -> Result<()> {
    let router = create_router(coordinator);

    if let Some(ct) = cancel_token {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                ct.cancelled().await;
                tracing::info!("HTTP server shutting down gracefully");
            })
            .await?;
    } else {
        axum::serve(listener, router).await?;
    }

    Ok(())
}

/// Bind `addr` and serve the relay
pub async fn serve(
    addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    cancel_token: Option<CancellationToken>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Relay listening on http://{}", listener.local_addr()?);
    serve_listener(listener, coordinator, cancel_token).await
}
