//! Frames exchanged between the UI process and the worker process.
//!
//! Each frame is one JSON object on its own line. A request id receives zero or more
//! `message` responses (streaming kinds), optionally a `result`, and then exactly one
//! terminal `complete` or `error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{RequestId, SessionId},
    model::types::{ConversationMessage, QueryContext, QueryOptions},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    Query,
    QueryOnce,
    CreateSession,
    SendToSession,
}

impl RequestKind {
    /// Kinds whose responses carry a stream of messages.
    pub fn is_streaming(self) -> bool {
        matches!(self, RequestKind::Query | RequestKind::SendToSession)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Query => "query",
            RequestKind::QueryOnce => "query_once",
            RequestKind::CreateSession => "create_session",
            RequestKind::SendToSession => "send_to_session",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<QueryOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<QueryContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub issued_at: DateTime<Utc>,
}

impl Request {
    pub fn new(kind: RequestKind, prompt: impl Into<String>) -> Self {
        Self {
            id: RequestId::generate(),
            kind,
            prompt: prompt.into(),
            options: None,
            context: None,
            session_id: None,
            issued_at: Utc::now(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_context(mut self, context: Option<QueryContext>) -> Self {
        self.context = context;
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseKind {
    Message,
    Result,
    Error,
    Complete,
}

/// Error kinds that survive the process boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    TransportUnavailable,
    QueryFailed,
    SessionNotFound,
    PermissionDenied,
    Timeout,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    /// The refused tool, for `permissionDenied`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            tool: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: RequestId,
    pub kind: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    pub issued_at: DateTime<Utc>,
}

impl Response {
    fn bare(id: RequestId, kind: ResponseKind) -> Self {
        Self {
            id,
            kind,
            payload: None,
            error: None,
            issued_at: Utc::now(),
        }
    }

    pub fn message(id: RequestId, message: &ConversationMessage) -> Result<Self> {
        let mut r = Self::bare(id, ResponseKind::Message);
        r.payload = Some(serde_json::to_value(message)?);
        Ok(r)
    }

    pub fn result(id: RequestId, payload: Value) -> Self {
        let mut r = Self::bare(id, ResponseKind::Result);
        r.payload = Some(payload);
        r
    }

    pub fn complete(id: RequestId) -> Self {
        Self::bare(id, ResponseKind::Complete)
    }

    pub fn error(id: RequestId, error: WireError) -> Self {
        let mut r = Self::bare(id, ResponseKind::Error);
        r.error = Some(error);
        r
    }

    /// `complete` and `error` end a request; the listener is released after them.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ResponseKind::Complete | ResponseKind::Error)
    }
}
