//! Responder side of the protocol: decodes requests, runs them against a [`Backend`], and
//! streams correlated responses back.
//!
//! Requests are handled concurrently. Every outbound frame goes through one writer task, so
//! frames from different requests never interleave mid-line.

use std::{sync::Arc, time::Instant};

use dashmap::DashSet;
use serde_json::json;
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    domain::SessionId,
    errors::Error,
    metrics::Metrics,
    model::{
        client::{Backend, BackendRequest},
        types::{ConversationMessage, QueryMetadata, QueryOnceResponse, QueryStatus},
    },
    protocol::{Request, RequestKind, Response},
    transport::{decode_frame, read_frame_line, write_frame},
    Result,
};

type Outbox = mpsc::UnboundedSender<Response>;

#[derive(Clone)]
pub struct Worker {
    backend: Arc<dyn Backend>,
    sessions: Arc<DashSet<SessionId>>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            sessions: Arc::new(DashSet::new()),
            metrics: Arc::new(Metrics::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Request durations, tool calls, and failures seen by this worker.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Cancel this token to stop serving; in-flight requests are aborted.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Serve on the process's stdin/stdout.
    pub async fn serve_stdio(&self) -> Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }

    /// Serve until end of input or shutdown. At end of input, requests already accepted
    /// are finished before returning.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!(backend = self.backend.name(), "worker serving");

        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = rx.recv().await {
                write_frame(&mut writer, &response).await?;
            }
            Ok::<(), Error>(())
        });

        let mut reader = reader;
        let mut buf = Vec::new();
        let mut tasks = JoinSet::new();
        let cancelled = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break true,
                line = read_frame_line(&mut reader, &mut buf) => {
                    let Some(line) = line? else { break false };
                    match decode_frame::<Request>(&line) {
                        Ok(Some(request)) => {
                            let worker = self.clone();
                            let tx = tx.clone();
                            tasks.spawn(async move { worker.handle(request, tx).await });
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "skipping request frame"),
                    }
                }
            }
        };

        if cancelled {
            info!(in_flight = tasks.len(), "worker shutting down");
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}

        drop(tx);
        writer_task
            .await
            .map_err(|e| Error::External(format!("response writer task failed: {e}")))??;
        info!("worker stopped");
        Ok(())
    }

    async fn handle(self, request: Request, tx: Outbox) {
        let id = request.id.clone();
        let kind = request.kind;
        debug!(request_id = %id, ?kind, "request received");
        let started = Instant::now();

        let outcome = match kind {
            RequestKind::CreateSession => self.create_session(&request, &tx),
            RequestKind::Query => self.stream(request, &tx).await,
            RequestKind::SendToSession => match self.known_session(&request) {
                Ok(()) => self.stream(request, &tx).await,
                Err(e) => Err(e),
            },
            RequestKind::QueryOnce => self.query_once(request, &tx).await,
        };
        self.metrics
            .record(kind.as_str(), started.elapsed(), outcome.as_ref().err());

        let terminal = match outcome {
            Ok(()) => Response::complete(id),
            Err(e) => {
                warn!(request_id = %id, ?kind, error = %e, "request failed");
                Response::error(id, e.to_wire())
            }
        };
        // A closed outbox means the writer is gone; there is nobody left to tell.
        let _ = tx.send(terminal);
    }

    fn create_session(&self, request: &Request, tx: &Outbox) -> Result<()> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(SessionId::generate);
        self.sessions.insert(session_id.clone());
        info!(session_id = %session_id, "session registered");
        send(
            tx,
            Response::result(request.id.clone(), json!({ "sessionId": session_id })),
        )
    }

    fn known_session(&self, request: &Request) -> Result<()> {
        let Some(session_id) = &request.session_id else {
            return Err(Error::SessionNotFound("<missing sessionId>".to_string()));
        };
        if !self.sessions.contains(session_id) {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn stream(&self, request: Request, tx: &Outbox) -> Result<()> {
        let id = request.id.clone();
        let backend_request = backend_request(request)?;
        let mut emit = |message: ConversationMessage| -> Result<()> {
            self.metrics.record_tool_calls(&message);
            send(tx, Response::message(id.clone(), &message)?)
        };
        self.backend
            .run(backend_request, &mut emit)
            .await
            .map_err(backend_failure)
    }

    async fn query_once(&self, request: Request, tx: &Outbox) -> Result<()> {
        let id = request.id.clone();
        let backend_request = backend_request(request)?;
        let started = Instant::now();

        let mut messages = Vec::new();
        let mut collect = |message: ConversationMessage| -> Result<()> {
            self.metrics.record_tool_calls(&message);
            messages.push(message);
            Ok(())
        };
        self.backend
            .run(backend_request, &mut collect)
            .await
            .map_err(backend_failure)?;

        let response = QueryOnceResponse {
            metadata: Some(QueryMetadata {
                turns_used: messages.len(),
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
            messages,
            status: QueryStatus::Success,
            error: None,
        };
        send(tx, Response::result(id, serde_json::to_value(&response)?))
    }
}

fn backend_request(request: Request) -> Result<BackendRequest> {
    let options = request.options.unwrap_or_default();
    options.validate()?;
    Ok(BackendRequest::new(request.prompt, options).with_context(request.context))
}

fn send(tx: &Outbox, response: Response) -> Result<()> {
    tx.send(response)
        .map_err(|_| Error::TransportUnavailable("response writer closed".to_string()))
}

/// Gate and session errors keep their kind; anything else the backend raised is a failed
/// query, which the client may retry.
fn backend_failure(err: Error) -> Error {
    match err {
        Error::PermissionDenied { .. }
        | Error::QueryFailed(_)
        | Error::Timeout(_)
        | Error::TransportUnavailable(_) => err,
        other => Error::QueryFailed(other.to_string()),
    }
}
