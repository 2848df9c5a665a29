//! Transport facade behind the drainable client.
//!
//! Implementations run requests however they like, but must complete every
//! ticket exactly once, populated or not. A lost ticket would keep the
//! client's pending count from ever reaching zero and stall `drain_fully`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::client::RequestTicket;
use super::{HttpRequest, HttpResponse, Method};

/// Completion callback handed to the transport alongside each ticket.
pub type CompletionFn = Box<dyn FnOnce(Arc<RequestTicket>) + Send + 'static>;

pub trait HttpTransport: Send + Sync {
    /// Executes the ticket's request and calls `on_done` exactly once, on
    /// any thread, whether or not a response could be produced.
    fn send(&self, ticket: Arc<RequestTicket>, on_done: CompletionFn);

    /// Releases transport resources.
    fn close(&self) {}
}

/// Transport backed by a shared `reqwest` client; one task per request.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, ticket: Arc<RequestTicket>, on_done: CompletionFn) {
        let client = self.client.clone();
        tokio::spawn(async move {
            match execute(&client, ticket.request()).await {
                Ok(response) => ticket.set_response(response),
                Err(err) => {
                    warn!(ticket = ticket.id(), "request failed: {err}");
                }
            }
            on_done(ticket);
        });
    }
}

async fn execute(
    client: &reqwest::Client,
    request: &HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let mut builder = client.request(to_reqwest_method(request.method()), request.url());
    for (name, value) in request.header_map() {
        builder = builder.header(name, value);
    }
    if let Some(body) = request.body_bytes() {
        builder = builder.body(body.to_vec());
    }
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.to_string(), value.to_string());
        }
    }
    let body = response.bytes().await?.to_vec();
    Ok(HttpResponse::new(status)
        .with_headers(headers)
        .with_body(body))
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Connect => reqwest::Method::CONNECT,
        Method::Options => reqwest::Method::OPTIONS,
        Method::Trace => reqwest::Method::TRACE,
        Method::Patch => reqwest::Method::PATCH,
    }
}
