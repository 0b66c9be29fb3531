use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::Credentials;
use crate::error::Error;
use crate::events::{Dispatcher, ListenerId, Notification, NotificationKind};
use crate::stream::client::{
    EventStream, IntoFlowSet, StreamError, StreamOptions, STREAM_ENDPOINT, STREAM_URL_ENV,
};

pub const API_BASE_URL: &str = "https://api.flowdock.com";
pub const API_URL_ENV: &str = "FLOWDOCK_API_URL";
const JSON_MEDIA_TYPE: &str = "application/json";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    /// Applies to REST calls only; stream requests are long-lived.
    pub request_timeout: Duration,
    /// Overrides `FLOWDOCK_API_URL` and the production default.
    pub api_url: Option<String>,
    /// Overrides `FLOWDOCK_STREAM_URL` and the production default.
    pub stream_url: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SessionDefaults::CONNECT_TIMEOUT,
            request_timeout: SessionDefaults::REQUEST_TIMEOUT,
            api_url: None,
            stream_url: None,
        }
    }
}

/// Authenticated Flowdock REST session.
///
/// Every failed call is returned to the caller and also published as an
/// `error` notification, so requests that nobody awaits still surface their
/// failures to listeners.
#[derive(Clone, Debug)]
pub struct Session {
    http: Client,
    credentials: Credentials,
    api_url: String,
    stream_url: String,
    request_timeout: Duration,
    dispatcher: Dispatcher,
}

impl Session {
    pub fn new(credentials: Credentials) -> Result<Self, ApiError> {
        Self::with_options(credentials, SessionOptions::default())
    }

    pub fn with_options(
        credentials: Credentials,
        options: SessionOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|err| ApiError::Transport(Arc::new(err)))?;

        Ok(Self::with_http_client(http, credentials, options))
    }

    /// Builds a session on a caller-owned client, sharing its connection pool.
    ///
    /// `options.connect_timeout` is ignored here; configure it on `http`.
    pub fn with_http_client(
        http: Client,
        credentials: Credentials,
        options: SessionOptions,
    ) -> Self {
        Self {
            http,
            credentials,
            api_url: resolve_url(options.api_url, API_URL_ENV, API_BASE_URL),
            stream_url: resolve_url(options.stream_url, STREAM_URL_ENV, STREAM_ENDPOINT),
            request_timeout: options.request_timeout,
            dispatcher: Dispatcher::new(),
        }
    }

    /// Sets an explicit REST base URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end().to_string();
        self
    }

    /// Sets an explicit stream endpoint for streams created afterwards.
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = url.into().trim_end().to_string();
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn http_client(&self) -> &Client {
        &self.http
    }

    /// Registry that receives this session's `error` notifications.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn on<F>(&self, kind: NotificationKind, listener: F) -> ListenerId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, listener)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.dispatcher.subscribe()
    }

    /// Creates an idle stream for `flows` sharing this session's client and
    /// credentials.
    ///
    /// The stream has its own dispatcher; register listeners on it before
    /// calling [`EventStream::connect`].
    pub fn stream(
        &self,
        flows: impl IntoFlowSet,
        options: StreamOptions,
    ) -> Result<EventStream, StreamError> {
        EventStream::new(
            self.http.clone(),
            self.credentials.clone(),
            self.stream_url.clone(),
            flows,
            options,
        )
    }

    /// Lists the flows the user belongs to, including their users.
    pub async fn flows(&self) -> Result<ApiResponse, ApiError> {
        self.get("/flows", &json!({ "users": 1 })).await
    }

    pub async fn send<T>(&self, path: &str, body: &T) -> Result<ApiResponse, ApiError>
    where
        T: Serialize + ?Sized,
    {
        self.post(path, body).await
    }

    pub async fn message(
        &self,
        flow_id: &str,
        content: &str,
        tags: &[&str],
    ) -> Result<ApiResponse, ApiError> {
        self.send("/messages", &MessagePayload::message(flow_id, content, tags))
            .await
    }

    /// Posts a message into an existing thread of `flow_id`.
    pub async fn thread_message(
        &self,
        flow_id: &str,
        thread_id: &str,
        content: &str,
        tags: &[&str],
    ) -> Result<ApiResponse, ApiError> {
        self.send(
            "/messages",
            &MessagePayload::thread_message(flow_id, thread_id, content, tags),
        )
        .await
    }

    /// Comments on message `parent_id`.
    pub async fn comment(
        &self,
        flow_id: &str,
        parent_id: u64,
        content: &str,
        tags: &[&str],
    ) -> Result<ApiResponse, ApiError> {
        self.send(
            "/comments",
            &CommentPayload::new(flow_id, parent_id, content, tags),
        )
        .await
    }

    pub async fn private_message(
        &self,
        user_id: impl Display,
        content: &str,
        tags: &[&str],
    ) -> Result<ApiResponse, ApiError> {
        let path = format!("/private/{user_id}/messages");
        self.send(&path, &MessagePayload::private_message(content, tags))
            .await
    }

    pub async fn status(&self, flow_id: &str, status: &str) -> Result<ApiResponse, ApiError> {
        self.send("/messages", &MessagePayload::status(flow_id, status))
            .await
    }

    pub async fn invite(
        &self,
        flow_id: &str,
        org_id: &str,
        email: &str,
        message: &str,
    ) -> Result<ApiResponse, ApiError> {
        let path = format!("/flows/{org_id}/{flow_id}/invitations");
        let payload = InvitationPayload {
            email: email.to_string(),
            message: message.to_string(),
        };
        self.send(&path, &payload).await
    }

    /// Replaces fields of an existing message with `data`.
    pub async fn edit_message<T>(
        &self,
        flow_id: &str,
        org_id: &str,
        message_id: impl Display,
        data: &T,
    ) -> Result<ApiResponse, ApiError>
    where
        T: Serialize + ?Sized,
    {
        let path = format!("/flows/{org_id}/{flow_id}/message/{message_id}");
        self.put(&path, data).await
    }

    /// Sends `query` as URL query parameters.
    pub async fn get<T>(&self, path: &str, query: &T) -> Result<ApiResponse, ApiError>
    where
        T: Serialize + ?Sized,
    {
        self.request(Method::GET, path, Some(query)).await
    }

    pub async fn post<T>(&self, path: &str, body: &T) -> Result<ApiResponse, ApiError>
    where
        T: Serialize + ?Sized,
    {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put<T>(&self, path: &str, body: &T) -> Result<ApiResponse, ApiError>
    where
        T: Serialize + ?Sized,
    {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.request::<Value>(Method::DELETE, path, None).await
    }

    /// Issues one authenticated request.
    ///
    /// For `GET` the body becomes query parameters; otherwise it is sent as
    /// JSON. Failures are published on `error` before being returned.
    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<ApiResponse, ApiError>
    where
        T: Serialize + ?Sized,
    {
        let result = self.send_attempt(method.clone(), path, body).await;
        if let Err(error) = &result {
            warn!(
                event = "api_request_failed",
                method = %method,
                path,
                error = %error
            );
            self.dispatcher
                .publish(&Notification::Error(Error::Api(error.clone())));
        }
        result
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send_attempt<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<ApiResponse, ApiError>
    where
        T: Serialize + ?Sized,
    {
        let endpoint = self.endpoint(path);
        debug!(event = "api_request", method = %method, endpoint = %endpoint);

        let mut builder = self
            .http
            .request(method.clone(), &endpoint)
            .timeout(self.request_timeout)
            .header(AUTHORIZATION, self.credentials.authorization())
            .header(ACCEPT, JSON_MEDIA_TYPE)
            .header(CONTENT_TYPE, JSON_MEDIA_TYPE);

        if let Some(body) = body {
            builder = match method {
                Method::GET => builder.query(body),
                Method::DELETE => builder,
                _ => builder.json(body),
            };
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ApiError::Transport(Arc::new(err)))?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|err| ApiError::Transport(Arc::new(err)))?;

        if status.as_u16() >= 300 {
            return Err(ApiError::HttpStatus { status, body: text });
        }

        Ok(ApiResponse {
            status,
            headers,
            body: parse_body(&text)?,
        })
    }
}

/// Decoded response body plus the response metadata.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// `Value::Null` when the server sent an empty body.
    pub body: Value,
}

impl ApiResponse {
    /// Deserializes the body into a caller-chosen shape.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        T::deserialize(&self.body).map_err(|err| ApiError::Parse(Arc::new(err)))
    }

    pub fn into_body(self) -> Value {
        self.body
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub event: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl MessagePayload {
    pub fn message(flow_id: &str, content: &str, tags: &[&str]) -> Self {
        Self {
            flow: Some(flow_id.to_string()),
            thread_id: None,
            event: "message".to_string(),
            content: content.to_string(),
            tags: Some(owned_tags(tags)),
        }
    }

    pub fn thread_message(flow_id: &str, thread_id: &str, content: &str, tags: &[&str]) -> Self {
        Self {
            thread_id: Some(thread_id.to_string()),
            ..Self::message(flow_id, content, tags)
        }
    }

    pub fn private_message(content: &str, tags: &[&str]) -> Self {
        Self {
            flow: None,
            thread_id: None,
            event: "message".to_string(),
            content: content.to_string(),
            tags: Some(owned_tags(tags)),
        }
    }

    pub fn status(flow_id: &str, status: &str) -> Self {
        Self {
            flow: Some(flow_id.to_string()),
            thread_id: None,
            event: "status".to_string(),
            content: status.to_string(),
            tags: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommentPayload {
    pub event: String,
    pub flow: String,
    /// Id of the message being commented on.
    pub message: u64,
    pub content: String,
    pub tags: Vec<String>,
}

impl CommentPayload {
    pub fn new(flow_id: &str, parent_id: u64, content: &str, tags: &[&str]) -> Self {
        Self {
            event: "comment".to_string(),
            flow: flow_id.to_string(),
            message: parent_id,
            content: content.to_string(),
            tags: owned_tags(tags),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InvitationPayload {
    pub email: String,
    pub message: String,
}

#[derive(Clone, Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(Arc<reqwest::Error>),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(Arc<serde_json::Error>),
}

impl ApiError {
    /// Status code of a rejected request.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            Self::Parse(_) => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

fn owned_tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|tag| tag.to_string()).collect()
}

fn parse_body(text: &str) -> Result<Value, ApiError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|err| ApiError::Parse(Arc::new(err)))
}

/// Explicit value, then environment, then the built-in default.
pub(crate) fn resolve_url(explicit: Option<String>, env_key: &str, default: &str) -> String {
    explicit
        .or_else(|| std::env::var(env_key).ok())
        .map(|url| url.trim_end().to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;

    use super::{
        parse_body, resolve_url, ApiError, ApiResponse, CommentPayload, MessagePayload, Session,
        SessionOptions, API_BASE_URL,
    };
    use crate::auth::Credentials;

    fn session() -> Session {
        Session::with_options(
            Credentials::new("user@example.com", SecretString::new("secret".to_string())),
            SessionOptions {
                api_url: Some("https://api.example.test/".to_string()),
                stream_url: Some("https://stream.example.test/flows".to_string()),
                ..SessionOptions::default()
            },
        )
        .expect("build session")
    }

    #[test]
    fn message_payload_matches_rest_shape() {
        let value = serde_json::to_value(MessagePayload::message("123", "hi", &[]))
            .expect("serialize payload");
        assert_eq!(
            value,
            json!({"flow": "123", "event": "message", "content": "hi", "tags": []})
        );
    }

    #[test]
    fn thread_message_carries_flow_and_thread() {
        let value = serde_json::to_value(MessagePayload::thread_message(
            "123",
            "thread-9",
            "reply",
            &["ops"],
        ))
        .expect("serialize payload");
        assert_eq!(
            value,
            json!({
                "flow": "123",
                "thread_id": "thread-9",
                "event": "message",
                "content": "reply",
                "tags": ["ops"]
            })
        );
    }

    #[test]
    fn status_and_private_payloads_omit_unused_fields() {
        let status = serde_json::to_value(MessagePayload::status("123", "lunch"))
            .expect("serialize status");
        assert_eq!(
            status,
            json!({"flow": "123", "event": "status", "content": "lunch"})
        );

        let private = serde_json::to_value(MessagePayload::private_message("psst", &[]))
            .expect("serialize private");
        assert_eq!(private, json!({"event": "message", "content": "psst", "tags": []}));
    }

    #[test]
    fn comment_payload_points_at_parent() {
        let value = serde_json::to_value(CommentPayload::new("123", 77, "nice", &["a"]))
            .expect("serialize comment");
        assert_eq!(
            value,
            json!({
                "event": "comment",
                "flow": "123",
                "message": 77,
                "content": "nice",
                "tags": ["a"]
            })
        );
    }

    #[test]
    fn endpoint_joins_base_and_path_with_single_slash() {
        let session = session();
        assert_eq!(session.api_url(), "https://api.example.test/");
        assert_eq!(
            session.endpoint("/messages"),
            "https://api.example.test/messages"
        );
        assert_eq!(session.endpoint("flows"), "https://api.example.test/flows");
    }

    #[test]
    fn explicit_url_beats_default() {
        assert_eq!(
            resolve_url(
                Some("http://localhost:3000  ".to_string()),
                "FLOWDOCK_SDK_TEST_UNSET_VAR",
                API_BASE_URL
            ),
            "http://localhost:3000"
        );
        assert_eq!(
            resolve_url(None, "FLOWDOCK_SDK_TEST_UNSET_VAR", API_BASE_URL),
            API_BASE_URL
        );
    }

    #[test]
    fn with_stream_url_is_used_by_new_streams() {
        let session = session().with_stream_url("http://127.0.0.1:9/flows\n");
        let stream = session
            .stream("123", Default::default())
            .expect("build stream");
        assert_eq!(stream.endpoint(), "http://127.0.0.1:9/flows");
        assert_eq!(stream.flows(), ["123".to_string()]);
    }

    #[test]
    fn empty_body_parses_as_null() {
        assert_eq!(parse_body("").expect("empty body"), serde_json::Value::Null);
        assert!(matches!(parse_body("<html>"), Err(ApiError::Parse(_))));
    }

    #[test]
    fn response_json_deserializes_body() {
        #[derive(serde::Deserialize)]
        struct Created {
            id: String,
        }

        let response = ApiResponse {
            status: reqwest::StatusCode::CREATED,
            headers: Default::default(),
            body: json!({"id": "abc"}),
        };
        let created: Created = response.json().expect("typed body");
        assert_eq!(created.id, "abc");
    }
}
