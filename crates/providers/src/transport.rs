//! HTTP transport shared by the network-backed providers.
//!
//! [`RestClient::stream_with`] turns a server-sent-events response into a
//! pull-based channel. A single producer task reads the body and pushes
//! mapped items through an `mpsc::channel(1)`, so at most one item waits
//! undelivered and the consumer's pace governs how fast the socket is read.
//! Dropping the receiver or aborting the signal drops the response, which
//! closes the connection.
//!
//! Every call reports `start`, then `success` or `error`, then `done` on its
//! own child scope (`fetch-<id>` / `stream-<id>`) of the emitter passed with
//! the call, or of the client's emitter when none is.

use std::time::Duration;

use futures::StreamExt;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use stepwise_core::{AbortSignal, Emitter, EventKind, EventPayload, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sse::{SseDecoder, SseMessage};

/// A non-streaming request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub body: Option<Value>,
    pub query: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            body: None,
            query: Vec::new(),
        }
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            query: Vec::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

pub struct RestClient {
    base_url: String,
    headers: Vec<(String, String)>,
    request_timeout: Duration,
    client: reqwest::Client,
    emitter: Emitter,
}

impl RestClient {
    /// `request_timeout` bounds a whole fetch and the connect phase of a
    /// stream; an open stream is bounded only by its abort signal.
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::NotConfigured(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: Vec::new(),
            request_timeout,
            client,
            emitter: Emitter::root(),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_bearer_auth(self, token: impl AsRef<str>) -> Self {
        let value = format!("Bearer {}", token.as_ref());
        self.with_header("Authorization", value)
    }

    /// Report transport events under this emitter.
    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn call_emitter(&self, parent: Option<&Emitter>, kind: &str) -> Emitter {
        parent.unwrap_or(&self.emitter).child(call_scope(kind))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.headers
            .iter()
            .fold(self.client.request(method, url), |builder, (name, value)| {
                builder.header(name.as_str(), value.as_str())
            })
    }

    /// Issue a request and decode the JSON body of a 2xx response.
    ///
    /// Any other status is a [`TransportError::Status`] carrying the body
    /// text; the body is never decoded as a success value.
    pub async fn fetch(
        &self,
        path: &str,
        request: FetchRequest,
        signal: &AbortSignal,
        parent: Option<&Emitter>,
    ) -> Result<Value, TransportError> {
        let emitter = self.call_emitter(parent, "fetch");
        let url = self.url(path);
        notify(
            &emitter,
            EventKind::Start,
            EventPayload::Request {
                method: request.method.to_string(),
                url: url.clone(),
            },
            true,
        )
        .await;

        let outcome = self.fetch_inner(&url, request, signal).await;
        match &outcome {
            Ok((status, _)) => {
                notify(
                    &emitter,
                    EventKind::Success,
                    EventPayload::Response { status: *status },
                    true,
                )
                .await
            }
            Err(e) => notify(&emitter, EventKind::Error, failure(e), false).await,
        }
        notify(&emitter, EventKind::Done, EventPayload::Empty, outcome.is_ok()).await;

        outcome.map(|(_, body)| body)
    }

    async fn fetch_inner(
        &self,
        url: &str,
        request: FetchRequest,
        signal: &AbortSignal,
    ) -> Result<(u16, Value), TransportError> {
        let mut builder = self
            .request(request.method, url)
            .timeout(self.request_timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(url, "Sending request");
        let response = cancellable(signal, builder.send())
            .await?
            .map_err(classify)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = cancellable(signal, response.text())
                .await?
                .unwrap_or_default();
            warn!(status, body = %message, "Request returned an error status");
            return Err(TransportError::Status {
                status_code: status,
                message,
            });
        }

        let body = cancellable(signal, response.json::<Value>())
            .await?
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok((status, body))
    }

    /// POST `body` and stream the server-sent events of the response.
    ///
    /// `map` turns each message into zero or one items for the consumer.
    /// An `event: error` message ends the stream with a
    /// [`TransportError::Stream`] instead of reaching `map`.
    pub async fn stream_with<T, F>(
        &self,
        path: &str,
        body: &Value,
        signal: &AbortSignal,
        parent: Option<&Emitter>,
        mut map: F,
    ) -> Result<mpsc::Receiver<Result<T, TransportError>>, TransportError>
    where
        T: Send + 'static,
        F: FnMut(SseMessage) -> Option<Result<T, TransportError>> + Send + 'static,
    {
        let emitter = self.call_emitter(parent, "stream");
        let url = self.url(path);
        notify(
            &emitter,
            EventKind::Start,
            EventPayload::Request {
                method: Method::POST.to_string(),
                url: url.clone(),
            },
            true,
        )
        .await;

        let response = match self.open_stream(&url, body, signal).await {
            Ok(response) => response,
            Err(e) => {
                notify(&emitter, EventKind::Error, failure(&e), false).await;
                notify(&emitter, EventKind::Done, EventPayload::Empty, false).await;
                return Err(e);
            }
        };

        let status = response.status().as_u16();
        let (tx, rx) = mpsc::channel(1);
        let signal = signal.clone();
        tokio::spawn(async move {
            let outcome = pump(response, &signal, &tx, &emitter, &mut map).await;
            let success = outcome.is_ok();
            match outcome {
                Ok(()) => {
                    notify(
                        &emitter,
                        EventKind::Success,
                        EventPayload::Response { status },
                        true,
                    )
                    .await
                }
                Err(e) => {
                    debug!(scope = %emitter.scope(), error = %e, "Stream ended with an error");
                    notify(&emitter, EventKind::Error, failure(&e), false).await;
                    let _ = tx.send(Err(e)).await;
                }
            }
            notify(&emitter, EventKind::Done, EventPayload::Empty, success).await;
            drop(tx);
        });

        Ok(rx)
    }

    async fn open_stream(
        &self,
        url: &str,
        body: &Value,
        signal: &AbortSignal,
    ) -> Result<reqwest::Response, TransportError> {
        let builder = self
            .request(Method::POST, url)
            .header(ACCEPT, "text/event-stream")
            .json(body);

        debug!(url, "Opening event stream");
        let response = cancellable(signal, builder.send())
            .await?
            .map_err(classify)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = cancellable(signal, response.text())
                .await?
                .unwrap_or_default();
            warn!(status, body = %message, "Stream request returned an error status");
            return Err(TransportError::Status {
                status_code: status,
                message,
            });
        }

        if let Some(content_type) = response.headers().get(CONTENT_TYPE) {
            let content_type = content_type.to_str().unwrap_or_default();
            if !content_type.starts_with("text/event-stream") {
                return Err(TransportError::Decode(format!(
                    "expected an event stream, got content type '{content_type}'"
                )));
            }
        }
        Ok(response)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("headers", &self.headers.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

async fn pump<T, F>(
    response: reqwest::Response,
    signal: &AbortSignal,
    tx: &mpsc::Sender<Result<T, TransportError>>,
    emitter: &Emitter,
    map: &mut F,
) -> Result<(), TransportError>
where
    F: FnMut(SseMessage) -> Option<Result<T, TransportError>>,
{
    let mut body = std::pin::pin!(response.bytes_stream());
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = signal.cancelled() => return Err(TransportError::Cancelled(signal.reason())),
            _ = tx.closed() => return Err(consumer_gone()),
            next = body.next() => next,
        };

        let messages = match next {
            Some(Ok(bytes)) => decoder.push(&bytes),
            Some(Err(e)) => return Err(TransportError::Interrupted(e.to_string())),
            None => {
                if let Some(last) = decoder.finish() {
                    deliver(last, signal, tx, emitter, map).await?;
                }
                return Ok(());
            }
        };
        for message in messages {
            deliver(message, signal, tx, emitter, map).await?;
        }
    }
}

async fn deliver<T, F>(
    message: SseMessage,
    signal: &AbortSignal,
    tx: &mpsc::Sender<Result<T, TransportError>>,
    emitter: &Emitter,
    map: &mut F,
) -> Result<(), TransportError>
where
    F: FnMut(SseMessage) -> Option<Result<T, TransportError>>,
{
    notify(
        emitter,
        EventKind::Message,
        EventPayload::Message {
            event: message.event.clone(),
            data: message.data.clone(),
        },
        true,
    )
    .await;

    if message.is_error() {
        return Err(stream_error(&message.data));
    }

    match map(message) {
        None => Ok(()),
        Some(Err(e)) => Err(e),
        Some(Ok(item)) => {
            tokio::select! {
                biased;
                _ = signal.cancelled() => Err(TransportError::Cancelled(signal.reason())),
                sent = tx.send(Ok(item)) => sent.map_err(|_| consumer_gone()),
            }
        }
    }
}

/// Build the error for an in-band `event: error` message.
///
/// The payload may be plain text or JSON carrying a message and a numeric
/// status, either at the top level or under `error`.
pub(crate) fn stream_error(data: &str) -> TransportError {
    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return TransportError::Stream {
            message: data.to_string(),
            status_code: None,
        };
    };

    let nested = json.get("error").filter(|e| e.is_object());
    let lookup = |key: &str| {
        nested
            .and_then(|e| e.get(key))
            .or_else(|| json.get(key))
    };

    let message = lookup("message")
        .and_then(Value::as_str)
        .or_else(|| json.get("error").and_then(Value::as_str))
        .unwrap_or(data)
        .to_string();
    let status_code = ["status", "status_code", "code"]
        .iter()
        .find_map(|key| lookup(key).and_then(Value::as_u64))
        .and_then(|code| u16::try_from(code).ok());

    TransportError::Stream {
        message,
        status_code,
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Connect(e.to_string())
    }
}

fn consumer_gone() -> TransportError {
    TransportError::Cancelled("stream consumer went away".into())
}

async fn cancellable<F>(signal: &AbortSignal, fut: F) -> Result<F::Output, TransportError>
where
    F: std::future::Future,
{
    signal
        .race(fut)
        .await
        .map_err(|_| TransportError::Cancelled(signal.reason()))
}

fn call_scope(kind: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{kind}-{}", &id[..8])
}

fn failure(e: &TransportError) -> EventPayload {
    EventPayload::Failure {
        kind: "transport".into(),
        message: e.to_string(),
    }
}

/// Transport events are informational; a failing observer never fails the call.
async fn notify(emitter: &Emitter, kind: EventKind, payload: EventPayload, success: bool) {
    if let Err(e) = emitter.emit(kind, payload, success).await {
        warn!(scope = %emitter.scope(), kind = %kind, error = %e, "Transport observer failed");
    }
}
