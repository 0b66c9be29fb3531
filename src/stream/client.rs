//! Flowdock streaming connection.
//!
//! An [`EventStream`] owns one `text/event-stream` request scoped to a set of
//! flows. `connect` performs the handshake (with a bounded number of
//! immediate retries) and then spawns a decode task that republishes every
//! push event through the stream's [`Dispatcher`]. The caller never waits on
//! the decode task; it observes the stream only through notifications.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::error::Error;
use crate::events::{Dispatcher, ListenerId, Notification, NotificationKind};
use crate::retry::{retry_async, RetryPolicy};
use crate::stream::sse::{EventDecoder, RawEvent};

/// Production streaming endpoint.
pub const STREAM_ENDPOINT: &str = "https://stream.flowdock.com/flows";
/// Environment variable overriding [`STREAM_ENDPOINT`].
pub const STREAM_URL_ENV: &str = "FLOWDOCK_STREAM_URL";

const FILTER_PARAM: &str = "filter";
/// Payloads at least this large are parsed off the async worker.
const OFFLOAD_PARSE_THRESHOLD: usize = 64 * 1024;

/// Extra query parameters sent with the stream request.
///
/// A `filter` key is ignored; the flow set always decides the filter.
pub type StreamOptions = BTreeMap<String, String>;

/// Conversion trait for the flows a stream is scoped to.
///
/// Accepts a single flow id or a list of them.
pub trait IntoFlowSet {
    /// Converts the input into an ordered list of flow ids.
    fn into_flow_set(self) -> Vec<String>;
}

impl IntoFlowSet for String {
    fn into_flow_set(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoFlowSet for &String {
    fn into_flow_set(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoFlowSet for &str {
    fn into_flow_set(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoFlowSet for Vec<String> {
    fn into_flow_set(self) -> Vec<String> {
        self
    }
}

impl IntoFlowSet for Vec<&str> {
    fn into_flow_set(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoFlowSet for &[String] {
    fn into_flow_set(self) -> Vec<String> {
        self.to_vec()
    }
}

impl IntoFlowSet for &[&str] {
    fn into_flow_set(self) -> Vec<String> {
        self.iter().map(|flow| flow.to_string()).collect()
    }
}

impl<const N: usize> IntoFlowSet for [&str; N] {
    fn into_flow_set(self) -> Vec<String> {
        self.iter().map(|flow| flow.to_string()).collect()
    }
}

/// Observable lifecycle of an [`EventStream`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamStatus {
    Idle,
    Connecting,
    Open,
    Closed,
}

enum StreamState {
    Idle,
    Connecting,
    Open {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Closed,
}

impl StreamState {
    fn status(&self) -> StreamStatus {
        match self {
            Self::Idle => StreamStatus::Idle,
            Self::Connecting => StreamStatus::Connecting,
            Self::Open { .. } => StreamStatus::Open,
            Self::Closed => StreamStatus::Closed,
        }
    }
}

/// Errors produced while opening or reading a stream.
#[derive(Clone, Debug, Error)]
pub enum StreamError {
    /// The flow set was empty.
    #[error("stream requires at least one flow")]
    NoFlows,

    /// Network failure before or while reading the response.
    #[error("stream request failed: {0}")]
    Transport(Arc<reqwest::Error>),

    /// The server refused the stream request.
    #[error("stream http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// The handshake did not succeed within the retry budget.
    #[error("stream handshake failed after {attempts} attempt(s): {source}")]
    Handshake {
        attempts: usize,
        #[source]
        source: Box<StreamError>,
    },

    /// A push event payload was not valid JSON.
    #[error("malformed event payload: {source}")]
    Decode {
        event: RawEvent,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// The event stream contained bytes that are not UTF-8.
    #[error("stream is not valid utf-8: {0}")]
    InvalidUtf8(Arc<std::str::Utf8Error>),

    /// An offloaded payload parse did not complete.
    #[error("payload parser stopped: {0}")]
    Parser(String),

    /// The server closed the stream.
    #[error("stream ended by server")]
    EndOfStream,
}

impl StreamError {
    /// Whether another handshake attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// A streaming connection to one or more flows.
///
/// Clones are handles to the same connection. A connection opens at most
/// once: after it closes, build a new one to reconnect. While open, the
/// decode task keeps the connection alive even if every handle is dropped;
/// call [`EventStream::end`] to stop it.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    http: Client,
    credentials: Credentials,
    url: String,
    flows: Vec<String>,
    options: StreamOptions,
    dispatcher: Dispatcher,
    state: Mutex<StreamState>,
}

impl StreamInner {
    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventStream {
    /// Creates an idle stream for `flows`.
    ///
    /// `http` may be shared with a [`crate::api::Session`]; no request is
    /// made until [`EventStream::connect`].
    pub fn new(
        http: Client,
        credentials: Credentials,
        endpoint: impl Into<String>,
        flows: impl IntoFlowSet,
        options: StreamOptions,
    ) -> Result<Self, StreamError> {
        let flows: Vec<String> = flows
            .into_flow_set()
            .into_iter()
            .filter(|flow| !flow.is_empty())
            .collect();
        if flows.is_empty() {
            return Err(StreamError::NoFlows);
        }

        let endpoint = endpoint.into();
        Ok(Self {
            inner: Arc::new(StreamInner {
                http,
                credentials,
                url: endpoint.trim_end().to_string(),
                flows,
                options,
                dispatcher: Dispatcher::new(),
                state: Mutex::new(StreamState::Idle),
            }),
        })
    }

    pub fn flows(&self) -> &[String] {
        &self.inner.flows
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.url
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.lock_state().status()
    }

    /// Registry this stream publishes to.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Shorthand for `self.dispatcher().on(kind, listener)`.
    pub fn on<F>(&self, kind: NotificationKind, listener: F) -> ListenerId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(kind, listener)
    }

    /// Shorthand for `self.dispatcher().subscribe()`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.inner.dispatcher.subscribe()
    }

    /// Opens the stream.
    ///
    /// The handshake is attempted once plus `retries` immediate retries;
    /// negative values mean no retries. On success `connected` is published
    /// before this returns and decoding continues in a background task. On
    /// failure the stream closes, `error` is published, and the handshake
    /// error is returned.
    ///
    /// Only transport failures and `5xx`/`429` replies are retried. Any other
    /// status, such as `401`, fails on the first attempt whatever the budget.
    ///
    /// Calling this on a stream that is connecting, open, or closed does
    /// nothing.
    pub async fn connect(&self, retries: i64) -> Result<(), StreamError> {
        {
            let mut state = self.inner.lock_state();
            if !matches!(*state, StreamState::Idle) {
                debug!(
                    event = "stream_connect_ignored",
                    status = ?state.status(),
                    url = %self.inner.url
                );
                return Ok(());
            }
            *state = StreamState::Connecting;
        }
        let _guard = HandshakeGuard { inner: &self.inner };

        let policy = RetryPolicy::from_budget(retries);
        let mut attempts = 0;
        let result = retry_async(
            &policy,
            |attempt| {
                attempts = attempt;
                self.open_transport(attempt)
            },
            StreamError::is_retryable,
        )
        .await;

        let response = match result {
            Ok(response) => response,
            Err(source) => {
                let error = StreamError::Handshake {
                    attempts,
                    source: Box::new(source),
                };
                let closed_here = {
                    let mut state = self.inner.lock_state();
                    let connecting = matches!(*state, StreamState::Connecting);
                    *state = StreamState::Closed;
                    connecting
                };
                warn!(
                    event = "stream_handshake_failed",
                    attempts,
                    url = %self.inner.url,
                    error = %error
                );
                if closed_here {
                    self.inner
                        .dispatcher
                        .publish(&Notification::Error(Error::Stream(error.clone())));
                }
                return Err(error);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut state = self.inner.lock_state();
            if !matches!(*state, StreamState::Connecting) {
                debug!(event = "stream_ended_during_handshake", url = %self.inner.url);
                return Ok(());
            }
            let task = tokio::spawn(run_decode_loop(
                self.clone(),
                response,
                ready_rx,
                shutdown_rx,
            ));
            *state = StreamState::Open {
                shutdown: shutdown_tx,
                task,
            };
        }

        info!(
            event = "stream_connected",
            attempts,
            flows = %self.inner.flows.join(","),
        );
        self.inner
            .dispatcher
            .publish(&Notification::Connected(self.clone()));
        let _ = ready_tx.send(());
        Ok(())
    }

    /// Closes the stream and waits for the decode task to stop.
    ///
    /// Publishes nothing. Does nothing on an idle or closed stream.
    pub async fn end(&self) {
        let previous = {
            let mut state = self.inner.lock_state();
            match *state {
                StreamState::Connecting | StreamState::Open { .. } => {
                    std::mem::replace(&mut *state, StreamState::Closed)
                }
                StreamState::Idle | StreamState::Closed => return,
            }
        };

        if let StreamState::Open { shutdown, task } = previous {
            let _ = shutdown.send(());
            if let Err(err) = task.await {
                warn!(event = "stream_task_join_failed", error = %err);
            }
        }
        info!(event = "stream_ended", url = %self.inner.url);
    }

    fn query_params(&self) -> Vec<(&str, String)> {
        let mut params = vec![(FILTER_PARAM, self.inner.flows.join(","))];
        params.extend(
            self.inner
                .options
                .iter()
                .filter(|(key, _)| key.as_str() != FILTER_PARAM)
                .map(|(key, value)| (key.as_str(), value.clone())),
        );
        params
    }

    async fn open_transport(&self, attempt: usize) -> Result<Response, StreamError> {
        debug!(event = "stream_handshake_attempt", attempt, url = %self.inner.url);

        let response = self
            .inner
            .http
            .get(&self.inner.url)
            .query(&self.query_params())
            .header(AUTHORIZATION, self.inner.credentials.authorization())
            .send()
            .await
            .map_err(|err| StreamError::Transport(Arc::new(err)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::HttpStatus { status, body });
        }
        Ok(response)
    }

    fn is_open(&self) -> bool {
        matches!(*self.inner.lock_state(), StreamState::Open { .. })
    }

    /// Moves an open stream to closed. Returns `false` if `end` got there
    /// first.
    fn close_from_loop(&self) -> bool {
        let mut state = self.inner.lock_state();
        if matches!(*state, StreamState::Open { .. }) {
            *state = StreamState::Closed;
            true
        } else {
            false
        }
    }

    async fn deliver_chunk(
        &self,
        decoder: &mut EventDecoder,
        chunk: &[u8],
    ) -> Result<(), LoopExit> {
        let (events, failure) = decoder.feed(chunk);
        for event in events {
            if !self.is_open() {
                return Err(LoopExit::Shutdown);
            }
            self.inner
                .dispatcher
                .publish(&Notification::RawData(event.clone()));
            let message = parse_payload(event).await.map_err(LoopExit::ClientError)?;
            self.inner
                .dispatcher
                .publish(&Notification::Message(message));
        }
        match failure {
            Some(error) => Err(LoopExit::ClientError(error)),
            None => Ok(()),
        }
    }

    fn finish(&self, exit: LoopExit) {
        if !self.close_from_loop() {
            debug!(event = "stream_loop_stopped", url = %self.inner.url);
            return;
        }

        match exit {
            LoopExit::Shutdown => {
                debug!(event = "stream_loop_stopped", url = %self.inner.url);
            }
            LoopExit::Disconnected(error) => {
                warn!(event = "stream_disconnected", url = %self.inner.url, error = %error);
                self.inner
                    .dispatcher
                    .publish(&Notification::Disconnected(error));
            }
            LoopExit::ClientError(error) => {
                warn!(event = "stream_client_error", url = %self.inner.url, error = %error);
                self.inner
                    .dispatcher
                    .publish(&Notification::ClientError(error));
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("url", &self.inner.url)
            .field("flows", &self.inner.flows)
            .field("options", &self.inner.options)
            .field("status", &self.status())
            .finish()
    }
}

/// Closes a stream whose `connect` future was dropped mid-handshake.
struct HandshakeGuard<'a> {
    inner: &'a StreamInner,
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        if matches!(*state, StreamState::Connecting) {
            *state = StreamState::Closed;
        }
    }
}

enum LoopExit {
    Shutdown,
    Disconnected(StreamError),
    ClientError(StreamError),
}

async fn run_decode_loop(
    stream: EventStream,
    response: Response,
    ready: oneshot::Receiver<()>,
    mut shutdown: oneshot::Receiver<()>,
) {
    if ready.await.is_err() {
        stream.finish(LoopExit::Shutdown);
        return;
    }

    let body = response.bytes_stream();
    futures_util::pin_mut!(body);
    let mut decoder = EventDecoder::new();

    let exit = loop {
        let chunk = tokio::select! {
            _ = &mut shutdown => break LoopExit::Shutdown,
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                if let Err(exit) = stream.deliver_chunk(&mut decoder, &bytes).await {
                    break exit;
                }
            }
            Some(Err(err)) => break LoopExit::Disconnected(StreamError::Transport(Arc::new(err))),
            None => {
                if decoder.has_partial() {
                    debug!(event = "stream_partial_event_dropped", url = %stream.inner.url);
                }
                break LoopExit::Disconnected(StreamError::EndOfStream);
            }
        }
    };

    stream.finish(exit);
}

async fn parse_payload(event: RawEvent) -> Result<Value, StreamError> {
    if event.data.len() < OFFLOAD_PARSE_THRESHOLD {
        return decode_payload(event);
    }

    tokio::task::spawn_blocking(move || decode_payload(event))
        .await
        .map_err(|err| StreamError::Parser(err.to_string()))?
}

fn decode_payload(event: RawEvent) -> Result<Value, StreamError> {
    match serde_json::from_str(&event.data) {
        Ok(value) => Ok(value),
        Err(err) => Err(StreamError::Decode {
            event,
            source: Arc::new(err),
        }),
    }
}
