//! Public client surface: streaming queries, one-shot queries, and sessions.
//!
//! Every call merges the caller's options over the configured defaults and passes the
//! result through the permission engine before anything is sent.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    correlator::Correlator,
    domain::SessionId,
    errors::Error,
    metrics::Metrics,
    model::types::{
        QueryContext, QueryMetadata, QueryOnceResponse, QueryOptions, QueryStatus,
    },
    permissions::PermissionEngine,
    presets::PresetCatalog,
    protocol::{Request, RequestKind},
    retry::{RetryPolicy, RetryingStream},
    session::{Session, SessionManager, TurnRunner, DEFAULT_MAX_HISTORY},
    stream::{MessageSource, MessageStream},
    transport::Transport,
    Result,
};

/// Everything a [`QueryClient`] needs besides its channel.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub retry: RetryPolicy,
    pub defaults: QueryOptions,
    /// Messages each session keeps.
    pub max_history: usize,
    pub engine: PermissionEngine,
    pub presets: PresetCatalog,
}

impl ClientSettings {
    pub fn new(presets: PresetCatalog) -> Self {
        Self {
            retry: RetryPolicy::default(),
            defaults: QueryOptions::default(),
            max_history: DEFAULT_MAX_HISTORY,
            engine: PermissionEngine::default(),
            presets,
        }
    }
}

/// Registers a stream for a request, then sends it.
#[derive(Clone)]
struct Dispatcher {
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
}

impl Dispatcher {
    async fn open(&self, request: Request, timeout: Option<Duration>) -> Result<MessageStream> {
        // Listener first so no early response is missed; a failed send drops the stream,
        // which releases it again.
        let stream = MessageStream::open(&self.correlator, request.id.clone(), timeout);
        self.transport.send(request).await?;
        Ok(stream)
    }

    fn stream(
        &self,
        retry: RetryPolicy,
        what: &'static str,
        request: impl Fn() -> Request + Send + 'static,
        timeout: Option<Duration>,
    ) -> RetryingStream {
        let dispatcher = self.clone();
        RetryingStream::new(retry, what, move || {
            let dispatcher = dispatcher.clone();
            // A fresh id per attempt.
            let request = request();
            async move { dispatcher.open(request, timeout).await }
        })
    }
}

/// State shared by the client and the turns of its sessions.
struct Shared {
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    defaults: QueryOptions,
    engine: RwLock<PermissionEngine>,
    metrics: Arc<Metrics>,
}

impl Shared {
    async fn prepare(&self, options: Option<&QueryOptions>) -> Result<QueryOptions> {
        self.metrics.time("prepare", self.merge_and_gate(options)).await
    }

    /// Merge over defaults, validate, and run the tool gate.
    async fn merge_and_gate(&self, options: Option<&QueryOptions>) -> Result<QueryOptions> {
        let mut merged = match options {
            Some(o) => self.defaults.merged(o),
            None => self.defaults.clone(),
        };
        merged.validate()?;

        let engine = self.engine.read().await;
        match &merged.allowed_tools {
            Some(tools) => {
                for tool in tools {
                    engine.check(*tool, None)?;
                }
            }
            None => merged.allowed_tools = Some(engine.allowed_tools()),
        }
        merged.permissions = Some(engine.narrowed_rules(merged.permissions.as_ref()));
        Ok(merged)
    }
}

#[async_trait]
impl TurnRunner for Shared {
    async fn stream_turn(
        &self,
        session_id: &SessionId,
        prompt: &str,
        options: &QueryOptions,
        context: QueryContext,
    ) -> Result<Box<dyn MessageSource>> {
        let options = self.prepare(Some(options)).await?;
        let timeout = options.timeout();
        let (session_id, prompt) = (session_id.clone(), prompt.to_string());
        let stream = self.dispatcher.stream(
            self.retry,
            "send_to_session",
            move || {
                Request::new(RequestKind::SendToSession, prompt.clone())
                    .with_session(session_id.clone())
                    .with_options(options.clone())
                    .with_context(Some(context.clone()))
            },
            timeout,
        );
        Ok(Box::new(stream))
    }
}

pub struct QueryClient {
    shared: Arc<Shared>,
    presets: PresetCatalog,
    sessions: SessionManager,
}

impl QueryClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        correlator: Arc<Correlator>,
        settings: ClientSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            dispatcher: Dispatcher {
                transport,
                correlator,
            },
            retry: settings.retry,
            defaults: settings.defaults,
            engine: RwLock::new(settings.engine),
            metrics: Arc::new(Metrics::new()),
        });
        // Session options are stored as given; defaults are merged at each turn.
        let sessions = SessionManager::new(shared.clone(), QueryOptions::default())
            .with_max_history(settings.max_history);
        Self {
            shared,
            presets: settings.presets,
            sessions,
        }
    }

    /// Stream the reply to `prompt`. Failures before the first message are retried.
    pub async fn query(
        &self,
        prompt: &str,
        options: Option<QueryOptions>,
        context: Option<QueryContext>,
    ) -> Result<RetryingStream> {
        let options = self.shared.prepare(options.as_ref()).await?;
        let timeout = options.timeout();
        let prompt = prompt.to_string();
        debug!(timeout = ?timeout, "issuing streaming query");

        Ok(self.shared.dispatcher.stream(
            self.shared.retry,
            "query",
            move || {
                Request::new(RequestKind::Query, prompt.clone())
                    .with_options(options.clone())
                    .with_context(context.clone())
            },
            timeout,
        ))
    }

    /// Run `prompt` to completion and return the aggregated reply.
    pub async fn query_once(
        &self,
        prompt: &str,
        options: Option<QueryOptions>,
        context: Option<QueryContext>,
    ) -> Result<QueryOnceResponse> {
        let metrics = &self.shared.metrics;
        let response = metrics
            .time("query_once", self.query_once_retrying(prompt, options, context))
            .await?;
        response.messages.iter().for_each(|m| metrics.record_tool_calls(m));
        Ok(response)
    }

    async fn query_once_retrying(
        &self,
        prompt: &str,
        options: Option<QueryOptions>,
        context: Option<QueryContext>,
    ) -> Result<QueryOnceResponse> {
        // Refusals are counted under `query_once` here, not `prepare`.
        let options = self.shared.merge_and_gate(options.as_ref()).await?;
        let timeout = options.timeout();
        let dispatcher = &self.shared.dispatcher;

        self.shared
            .retry
            .run("query_once", |attempt| {
                let request = Request::new(RequestKind::QueryOnce, prompt)
                    .with_options(options.clone())
                    .with_context(context.clone());
                async move {
                    debug!(request_id = %request.id, attempt, "issuing one-shot query");
                    let started = Instant::now();
                    let (messages, result) = dispatcher.open(request, timeout).await?.collect().await?;
                    match result {
                        Some(payload) => Ok(serde_json::from_value(payload)?),
                        // Peer streamed instead of aggregating; aggregate here.
                        None => Ok(QueryOnceResponse {
                            metadata: Some(QueryMetadata {
                                turns_used: messages.len(),
                                duration_ms: u64::try_from(started.elapsed().as_millis())
                                    .unwrap_or(u64::MAX),
                            }),
                            messages,
                            status: QueryStatus::Success,
                            error: None,
                        }),
                    }
                }
            })
            .await
    }

    /// The text of the last assistant message in a one-shot reply.
    pub async fn ask(&self, prompt: &str, options: Option<QueryOptions>) -> Result<String> {
        let response = self.query_once(prompt, options, None).await?;
        Ok(response.last_assistant_text().unwrap_or_default().to_string())
    }

    /// Return the session for `id`, creating it (and registering it with the worker)
    /// when it does not exist yet.
    pub async fn session(
        &self,
        id: Option<SessionId>,
        options: Option<QueryOptions>,
    ) -> Result<Arc<Session>> {
        let (session, created) = self.sessions.open(id, options.as_ref()).await;
        if !created {
            return Ok(session);
        }

        if let Err(e) = self.register_session(&session).await {
            warn!(session_id = %session.id(), error = %e, "session registration failed");
            self.sessions.remove(session.id()).await;
            return Err(e);
        }
        Ok(session)
    }

    async fn register_session(&self, session: &Session) -> Result<()> {
        let options = self.shared.prepare(Some(session.options())).await?;
        let timeout = options.timeout();
        let dispatcher = &self.shared.dispatcher;
        self.shared
            .retry
            .run("create_session", |_| {
                let request = Request::new(RequestKind::CreateSession, "")
                    .with_session(session.id().clone())
                    .with_options(options.clone());
                async move {
                    dispatcher.open(request, timeout).await?.collect().await?;
                    Ok(())
                }
            })
            .await
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.sessions.get(id).await
    }

    pub async fn close_session(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).await
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn presets(&self) -> &PresetCatalog {
        &self.presets
    }

    pub async fn apply_preset(&self, name: &str) -> Result<()> {
        let preset = self.presets.get(name)?;
        self.shared.engine.write().await.apply_preset(preset);
        info!(preset = %preset.name, "applied permission preset");
        Ok(())
    }

    /// Copy of the current permission engine.
    pub async fn permissions(&self) -> PermissionEngine {
        self.shared.engine.read().await.clone()
    }

    /// Mutate the permission engine in place.
    pub async fn update_permissions<R>(&self, f: impl FnOnce(&mut PermissionEngine) -> R) -> R {
        f(&mut *self.shared.engine.write().await)
    }

    /// Client-side timings: option preparation and one-shot queries.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.dispatcher.transport.is_open()
    }
}

impl From<Error> for QueryOnceResponse {
    /// An error reply in the aggregated shape, for callers that report rather than fail.
    fn from(err: Error) -> Self {
        QueryOnceResponse {
            messages: Vec::new(),
            status: QueryStatus::Error,
            error: Some(err.to_string()),
            metadata: None,
        }
    }
}
