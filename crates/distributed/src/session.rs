//! Client session contract and response messages.

use gqd_common::{GqdError, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Status code carried by every response written to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u16")]
pub enum ResponseStatus {
    /// Final response of a job whose result stream ended normally.
    Success,
    /// Final response of a request that produced no job output.
    NoContent,
    /// One batch of results; more responses follow.
    PartialContent,
    /// Job torn down before it reached a terminal state.
    Cancelled,
    ServerError,
    /// Request rejected before any job was submitted.
    ServerErrorEvaluation,
}

impl ResponseStatus {
    pub fn code(self) -> u16 {
        match self {
            ResponseStatus::Success => 200,
            ResponseStatus::NoContent => 204,
            ResponseStatus::PartialContent => 206,
            ResponseStatus::Cancelled => 499,
            ResponseStatus::ServerError => 500,
            ResponseStatus::ServerErrorEvaluation => 597,
        }
    }

    pub fn is_server_error(self) -> bool {
        self.code() >= 500
    }

    /// Every status except [`ResponseStatus::PartialContent`] ends a request.
    pub fn is_terminal(self) -> bool {
        self != ResponseStatus::PartialContent
    }

    /// Map a dispatch failure to the status reported to the client.
    pub fn for_error(err: &GqdError) -> Self {
        match err {
            GqdError::Unsupported(_)
            | GqdError::Planning(_)
            | GqdError::Compile(_)
            | GqdError::MalformedPlan(_)
            | GqdError::SessionBusy(_) => ResponseStatus::ServerErrorEvaluation,
            GqdError::InvalidConfig(_)
            | GqdError::Metadata(_)
            | GqdError::Submission(_)
            | GqdError::Stream(_)
            | GqdError::Protocol(_)
            | GqdError::Execution(_)
            | GqdError::Io(_) => ResponseStatus::ServerError,
        }
    }
}

impl From<ResponseStatus> for u16 {
    fn from(status: ResponseStatus) -> Self {
        status.code()
    }
}

/// One response written to a client session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMessage {
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<Value>,
}

impl ResponseMessage {
    pub fn partial(request_id: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::PartialContent,
            message: String::new(),
            data,
        }
    }

    pub fn success(request_id: impl Into<String>) -> Self {
        Self::terminal(request_id, ResponseStatus::Success, String::new())
    }

    pub fn cancelled(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::terminal(request_id, ResponseStatus::Cancelled, message)
    }

    /// Terminal error response; the message is the error's display text.
    pub fn error(request_id: impl Into<String>, err: &GqdError) -> Self {
        Self::terminal(request_id, ResponseStatus::for_error(err), err.to_string())
    }

    fn terminal(
        request_id: impl Into<String>,
        status: ResponseStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            message: message.into(),
            data: Vec::new(),
        }
    }
}

/// Write side of a client connection.
///
/// Writes for one job are issued by exactly one task, in frame order.
pub trait Session: Send + Sync {
    /// Stable session id, used for per-session concurrency accounting.
    fn id(&self) -> &str;
    fn write(&self, response: ResponseMessage) -> Result<()>;
}

/// Session that forwards responses into a tokio channel.
///
/// Used by the dispatch binary and by tests to observe what a client would see.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    id: String,
    tx: mpsc::UnboundedSender<ResponseMessage>,
}

impl ChannelSession {
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ResponseMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }
}

impl Session for ChannelSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn write(&self, response: ResponseMessage) -> Result<()> {
        self.tx
            .send(response)
            .map_err(|_| GqdError::Execution(format!("session {} is closed", self.id)))
    }
}
