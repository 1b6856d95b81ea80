//! Outbound HTTP plumbing for calls into the routing cluster.
//!
//! A [`Transactor`] is any async function from a request to a response. The
//! [`retry`] module decorates one with bounded retries; [`http_transactor`]
//! adapts a `reqwest::Client` into one.

pub mod retry;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

pub use retry::{
    default_should_retry, retry_transactor, RetryOptions, ShouldRetry, Temporary,
};

/// Async request executor that can be shared between tasks.
pub type Transactor<Req, Resp, E> =
    Arc<dyn Fn(Req) -> BoxFuture<'static, Result<Resp, E>> + Send + Sync>;

/// Cloneable description of an outbound HTTP request, so a retry can resend it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type HttpFuture = BoxFuture<'static, Result<HttpResponse, reqwest::Error>>;

/// Execute [`HttpRequest`]s with `client`.
pub fn http_transactor(
    client: reqwest::Client,
) -> Transactor<HttpRequest, HttpResponse, reqwest::Error> {
    Arc::new(move |request: HttpRequest| -> HttpFuture {
        let client = client.clone();
        Box::pin(async move {
            let response = client
                .request(request.method, &request.url)
                .headers(request.headers)
                .body(request.body)
                .send()
                .await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    })
}
