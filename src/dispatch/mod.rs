//! http transport to the chat backend.
//!
//! - `ChatTransport` is the seam the plugin talks to; apps (and tests) inject
//!   an implementation through `ChatBackend`.
//! - native uses `reqwest` on a tokio runtime owned by the transport.
//! - wasm uses `gloo-net` and reads the fetch body as a `ReadableStream`.

use serde::{Deserialize, Serialize};

use crate::session::Source;

#[cfg(not(target_arch = "wasm32"))]
mod native;
#[cfg(target_arch = "wasm32")]
mod web;

#[cfg(not(target_arch = "wasm32"))]
pub use native::ReqwestTransport;
#[cfg(target_arch = "wasm32")]
pub use web::FetchTransport;

/// request body for both chat endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct ChatRequestBody<'a> {
    pub message: &'a str,
}

/// whole-response reply from `POST /chat/message`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub sources: Vec<Source>,
}

/// reply from `POST /sessions`. the id is opaque.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
}

/// structured error envelope a failing backend may send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// no response was received.
    Connection,
    /// a response arrived with a non-success status.
    Http,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Network error: {message}")]
    Connection { message: String },
    #[error("{message}")]
    Http {
        status: u16,
        status_text: String,
        message: String,
        body: Option<ErrorBody>,
    },
}

impl DispatchError {
    pub fn connection(cause: impl std::fmt::Display) -> Self {
        Self::Connection {
            message: cause.to_string(),
        }
    }

    /// build an http failure from the raw error body.
    ///
    /// prefers the backend's `{"error": ...}` message; falls back to
    /// `HTTP <status> <statusText>` when the body is absent or not that shape.
    pub fn http(status: u16, status_text: &str, body: &[u8]) -> Self {
        let body = serde_json::from_slice::<ErrorBody>(body).ok();
        let message = match &body {
            Some(b) => b.error.clone(),
            None => format!("HTTP {status} {status_text}").trim_end().to_string(),
        };
        Self::Http {
            status,
            status_text: status_text.to_string(),
            message,
            body,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Http { .. } => ErrorKind::Http,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Connection { .. } => None,
        }
    }
}

/// raw body chunks of a streaming response, in arrival order.
pub type ByteChunks = futures_lite::stream::Boxed<Result<Vec<u8>, DispatchError>>;

/// endpoints of the chat backend, relative to a configured base url.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    base_url: String,
}

impl Endpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn sessions(&self) -> String {
        format!("{}/sessions", self.base_url)
    }

    pub fn message(&self) -> String {
        format!("{}/chat/message", self.base_url)
    }

    pub fn message_stream(&self) -> String {
        format!("{}/chat/message/stream", self.base_url)
    }
}

/// the three calls the client makes against the backend.
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
pub trait ChatTransport: Send + Sync {
    /// `POST /chat/message`: wait for the whole reply.
    async fn send_message(&self, text: &str) -> Result<ChatReply, DispatchError>;

    /// `POST /chat/message/stream`: resolve once the status is known, then
    /// yield body chunks. status failures are reported here, not in the stream.
    async fn send_message_stream(&self, text: &str) -> Result<ByteChunks, DispatchError>;

    /// `POST /sessions`.
    async fn create_session(&self) -> Result<SessionInfo, DispatchError>;
}
