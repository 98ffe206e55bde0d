//! Request forwarding to a selected replica.
//!
//! A failed backend is reported to the caller as-is. There is no retry against
//! another replica.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures_util::Stream;
use reqwest::Client;

use super::error::RouterError;
use super::types::{EndpointRef, FailureKind, ProxyResult};

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Headers to send upstream: everything except hop-by-hop, host and length
pub fn forwardable_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == header::HOST || *name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers to relay back to the caller
pub fn preserve_response_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Forward `body` to `<endpoint><path>` and relay the backend's answer.
///
/// With `stream` set, the response body is passed through chunk by chunk as it
/// arrives. Dropping the returned body (caller disconnect) drops the upstream
/// connection with it.
pub async fn forward(
    client: &Client,
    model: &str,
    endpoint: EndpointRef,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
    stream: bool,
) -> Result<Response, RouterError> {
    let started = Instant::now();
    let url = endpoint.url_for(path);

    let sent = client
        .post(&url)
        .headers(forwardable_request_headers(headers))
        .body(body)
        .send()
        .await;

    let res = match sent {
        Ok(res) => res,
        Err(e) => {
            let (failure, err) = classify_transport_error(&e, &endpoint, e.to_string());
            ProxyResult {
                model: model.to_string(),
                status_code: err.status_code().as_u16(),
                bytes_forwarded: 0,
                selected_endpoint: endpoint,
                failure_kind: Some(failure),
                elapsed: started.elapsed(),
            }
            .record();
            return Err(err);
        }
    };

    let status =
        StatusCode::from_u16(res.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response_headers = preserve_response_headers(res.headers());

    if stream {
        if !response_headers.contains_key(header::CONTENT_TYPE) {
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
        }

        let relay = RelayStream::new(
            Box::pin(res.bytes_stream()),
            ProxyResult {
                model: model.to_string(),
                status_code: status.as_u16(),
                bytes_forwarded: 0,
                selected_endpoint: endpoint,
                failure_kind: None,
                elapsed: started.elapsed(),
            },
            started,
        );

        let mut response = Response::new(Body::from_stream(relay));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        return Ok(response);
    }

    match res.bytes().await {
        Ok(bytes) => {
            ProxyResult {
                model: model.to_string(),
                status_code: status.as_u16(),
                bytes_forwarded: bytes.len() as u64,
                selected_endpoint: endpoint,
                failure_kind: None,
                elapsed: started.elapsed(),
            }
            .record();

            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = response_headers;
            Ok(response)
        }
        Err(e) => {
            let (failure, err) = classify_transport_error(
                &e,
                &endpoint,
                format!("failed to read response body: {}", e),
            );
            ProxyResult {
                model: model.to_string(),
                status_code: err.status_code().as_u16(),
                bytes_forwarded: 0,
                selected_endpoint: endpoint,
                failure_kind: Some(failure),
                elapsed: started.elapsed(),
            }
            .record();
            Err(err)
        }
    }
}

fn classify_transport_error(
    e: &reqwest::Error,
    endpoint: &EndpointRef,
    reason: String,
) -> (FailureKind, RouterError) {
    if e.is_timeout() {
        (
            FailureKind::BackendTimeout,
            RouterError::BackendTimeout {
                endpoint: endpoint.base_url.clone(),
            },
        )
    } else {
        (
            FailureKind::BackendUnreachable,
            RouterError::BackendUnreachable {
                endpoint: endpoint.base_url.clone(),
                reason,
            },
        )
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Passes upstream chunks straight through and records the outcome once the
/// stream ends or is dropped.
struct RelayStream {
    inner: ChunkStream,
    result: ProxyResult,
    started: Instant,
    finished: bool,
}

impl RelayStream {
    fn new(inner: ChunkStream, result: ProxyResult, started: Instant) -> Self {
        Self {
            inner,
            result,
            started,
            finished: false,
        }
    }
}

impl Stream for RelayStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.result.bytes_forwarded += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.result.failure_kind = Some(if e.is_timeout() {
                    FailureKind::BackendTimeout
                } else {
                    FailureKind::StreamInterrupted
                });
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if !self.finished {
            self.result.failure_kind = Some(FailureKind::ClientDisconnected);
        }
        self.result.elapsed = self.started.elapsed();
        self.result.record();
    }
}
