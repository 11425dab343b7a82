//! Conversation sessions: ordered history plus the options every turn is sent with.
//!
//! A session owns its history. `send` appends the user turn before the query is issued,
//! then records assistant messages as they stream in. The session's turn lock is held for
//! as long as the returned [`SessionTurn`] lives, so sends on one session never interleave.
//! The state lock is separate and only taken per read or push, so the session stays
//! readable while a turn is in progress. History keeps the most recent `max_history`
//! messages.

use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::{
    domain::SessionId,
    errors::Error,
    model::types::{ConversationMessage, QueryContext, QueryOptions, Role, UserInfo},
    stream::MessageSource,
    utils::truncate_text,
    Result,
};

const PREVIEW_CHARS: usize = 100;

pub const DEFAULT_MAX_HISTORY: usize = 100;

/// Issues the streaming query behind one session turn.
#[async_trait]
pub trait TurnRunner: Send + Sync {
    async fn stream_turn(
        &self,
        session_id: &SessionId,
        prompt: &str,
        options: &QueryOptions,
        context: QueryContext,
    ) -> Result<Box<dyn MessageSource>>;
}

#[derive(Debug, Default)]
struct SessionState {
    history: Vec<ConversationMessage>,
    user: Option<UserInfo>,
    context_data: Map<String, Value>,
}

impl SessionState {
    fn push(&mut self, message: ConversationMessage, cap: usize) {
        self.history.push(message);
        trim_front(&mut self.history, cap);
    }
}

fn trim_front(history: &mut Vec<ConversationMessage>, cap: usize) {
    if history.len() > cap {
        let excess = history.len() - cap;
        history.drain(..excess);
    }
}

/// Everything needed to rebuild a session after a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    #[serde(default)]
    pub options: QueryOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub history: Vec<ConversationMessage>,
    #[serde(default)]
    pub context_data: Map<String, Value>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub message_count: usize,
    pub last_message: Option<String>,
    pub context_keys: Vec<String>,
}

pub struct Session {
    id: SessionId,
    options: QueryOptions,
    runner: Arc<dyn TurnRunner>,
    max_history: usize,
    turn: Arc<Mutex<()>>,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    fn new(
        id: SessionId,
        options: QueryOptions,
        runner: Arc<dyn TurnRunner>,
        max_history: usize,
    ) -> Self {
        Self {
            id,
            options,
            runner,
            max_history: max_history.max(1),
            turn: Arc::new(Mutex::new(())),
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Start a turn. Waits while another turn on this session is still alive.
    pub async fn send(&self, prompt: &str) -> Result<SessionTurn> {
        let turn = Arc::clone(&self.turn).lock_owned().await;

        let context = {
            let mut state = self.state.lock().await;
            state.push(ConversationMessage::user(prompt), self.max_history);
            QueryContext {
                session_id: Some(self.id.clone()),
                user: state.user.clone(),
                history: state.history.clone(),
                context_data: state.context_data.clone(),
            }
        };
        debug!(session_id = %self.id, turns = context.history.len(), "sending session turn");

        let source = self
            .runner
            .stream_turn(&self.id, prompt, &self.options, context)
            .await?;
        Ok(SessionTurn {
            _turn: turn,
            state: Arc::clone(&self.state),
            max_history: self.max_history,
            source,
        })
    }

    pub async fn history(&self) -> Vec<ConversationMessage> {
        self.state.lock().await.history.clone()
    }

    /// Forget every turn; the id and options are kept.
    pub async fn clear_history(&self) {
        self.state.lock().await.history.clear();
        info!(session_id = %self.id, "session history cleared");
    }

    pub async fn set_user(&self, user: Option<UserInfo>) {
        self.state.lock().await.user = user;
    }

    pub async fn set_context_value(&self, key: impl Into<String>, value: Value) {
        self.state.lock().await.context_data.insert(key.into(), value);
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            session_id: self.id.clone(),
            options: self.options.clone(),
            user: state.user.clone(),
            history: state.history.clone(),
            context_data: state.context_data.clone(),
            saved_at: Utc::now(),
        }
    }

    pub async fn summary(&self) -> SessionSummary {
        let state = self.state.lock().await;
        SessionSummary {
            session_id: self.id.clone(),
            message_count: state.history.len(),
            last_message: state
                .history
                .last()
                .map(|m| truncate_text(&m.content, PREVIEW_CHARS)),
            context_keys: state.context_data.keys().cloned().collect(),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&snapshot)?).await?;
        Ok(())
    }
}

/// One in-progress turn. Assistant messages are appended to the session history as they
/// are pulled, so a turn that fails midway still leaves its partial output recorded.
pub struct SessionTurn {
    _turn: OwnedMutexGuard<()>,
    state: Arc<Mutex<SessionState>>,
    max_history: usize,
    source: Box<dyn MessageSource>,
}

impl SessionTurn {
    pub async fn next(&mut self) -> Option<Result<ConversationMessage>> {
        let item = self.source.next_message().await?;
        if let Ok(m) = &item {
            if m.role == Role::Assistant {
                self.state.lock().await.push(m.clone(), self.max_history);
            }
        }
        Some(item)
    }

    /// Drain the turn and return the messages it produced.
    pub async fn collect(mut self) -> Result<Vec<ConversationMessage>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

/// Registry of live sessions.
pub struct SessionManager {
    runner: Arc<dyn TurnRunner>,
    defaults: QueryOptions,
    max_history: usize,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(runner: Arc<dyn TurnRunner>, defaults: QueryOptions) -> Self {
        Self {
            runner,
            defaults,
            max_history: DEFAULT_MAX_HISTORY,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Cap on the messages each session keeps; the oldest are dropped first.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    /// Return the session for `id`, creating it (with a fresh id when none is given).
    /// The flag is `true` when the session was created by this call.
    pub async fn open(
        &self,
        id: Option<SessionId>,
        options: Option<&QueryOptions>,
    ) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = id.as_ref().and_then(|id| sessions.get(id)) {
            return (Arc::clone(existing), false);
        }

        let id = id.unwrap_or_else(SessionId::generate);
        let options = match options {
            Some(o) => self.defaults.merged(o),
            None => self.defaults.clone(),
        };
        let session = Arc::new(Session::new(
            id.clone(),
            options,
            Arc::clone(&self.runner),
            self.max_history,
        ));
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(session_id = %id, "session created");
        (session, true)
    }

    pub async fn get_or_create(&self, id: Option<SessionId>) -> Arc<Session> {
        self.open(id, None).await.0
    }

    pub async fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    pub async fn remove(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.remove(id).is_some()
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Rebuild a session from a snapshot, replacing any live session with the same id.
    pub async fn restore(&self, snapshot: SessionSnapshot) -> Arc<Session> {
        let session = Session::new(
            snapshot.session_id.clone(),
            snapshot.options,
            Arc::clone(&self.runner),
            self.max_history,
        );
        {
            let mut state = session.state.lock().await;
            state.history = snapshot.history;
            trim_front(&mut state.history, session.max_history);
            state.user = snapshot.user;
            state.context_data = snapshot.context_data;
        }
        let session = Arc::new(session);
        self.sessions
            .lock()
            .await
            .insert(snapshot.session_id, Arc::clone(&session));
        session
    }

    pub async fn load(&self, path: &Path) -> Result<Arc<Session>> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::InvalidPath {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&bytes)?;
        Ok(self.restore(snapshot).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, sync::Mutex as StdMutex, time::Duration};

    struct VecSource(VecDeque<Result<ConversationMessage>>);

    #[async_trait]
    impl MessageSource for VecSource {
        async fn next_message(&mut self) -> Option<Result<ConversationMessage>> {
            self.0.pop_front()
        }
    }

    /// Replies with `reply:<prompt>` and records the context each turn was sent with.
    #[derive(Default)]
    struct FakeRunner {
        contexts: StdMutex<Vec<QueryContext>>,
        fail_after_first: bool,
    }

    #[async_trait]
    impl TurnRunner for FakeRunner {
        async fn stream_turn(
            &self,
            _session_id: &SessionId,
            prompt: &str,
            _options: &QueryOptions,
            context: QueryContext,
        ) -> Result<Box<dyn MessageSource>> {
            self.contexts.lock().unwrap().push(context);
            let mut items = VecDeque::new();
            items.push_back(Ok(ConversationMessage::assistant(format!("reply:{prompt}"))));
            if self.fail_after_first {
                items.push_back(Err(Error::QueryFailed("cut off".into())));
            } else {
                items.push_back(Ok(ConversationMessage::assistant("done")));
            }
            Ok(Box::new(VecSource(items)))
        }
    }

    fn manager(runner: Arc<FakeRunner>) -> SessionManager {
        SessionManager::new(runner, QueryOptions::default())
    }

    fn contents(history: &[ConversationMessage]) -> Vec<(Role, &str)> {
        history.iter().map(|m| (m.role, m.content.as_str())).collect()
    }

    #[tokio::test]
    async fn send_records_user_turn_then_assistant_replies() {
        let sessions = manager(Arc::new(FakeRunner::default()));
        let session = sessions.get_or_create(None).await;

        let replies = session.send("hi").await.unwrap().collect().await.unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(
            contents(&session.history().await),
            vec![
                (Role::User, "hi"),
                (Role::Assistant, "reply:hi"),
                (Role::Assistant, "done"),
            ]
        );
    }

    #[tokio::test]
    async fn sequential_sends_keep_order_and_carry_full_history() {
        let runner = Arc::new(FakeRunner::default());
        let sessions = manager(Arc::clone(&runner));
        let session = sessions.get_or_create(Some("s1".into())).await;

        session.send("a").await.unwrap().collect().await.unwrap();
        session.send("b").await.unwrap().collect().await.unwrap();

        let history = session.history().await;
        assert_eq!(history.len(), 2 + 4);
        assert_eq!(history[0].content, "a");
        assert_eq!(history[3].content, "b");

        let contexts = runner.contexts.lock().unwrap();
        assert_eq!(contexts[0].history.len(), 1);
        assert_eq!(contexts[1].history.len(), 4);
        assert_eq!(contexts[1].session_id, Some(SessionId::from("s1")));
    }

    #[tokio::test]
    async fn partial_output_is_recorded_when_a_turn_fails() {
        let runner = Arc::new(FakeRunner {
            fail_after_first: true,
            ..Default::default()
        });
        let sessions = manager(runner);
        let session = sessions.get_or_create(None).await;

        let err = session.send("q").await.unwrap().collect().await.unwrap_err();
        assert!(matches!(err, Error::QueryFailed(_)));
        assert_eq!(
            contents(&session.history().await),
            vec![(Role::User, "q"), (Role::Assistant, "reply:q")]
        );
    }

    #[tokio::test]
    async fn second_send_waits_for_the_live_turn() {
        let sessions = manager(Arc::new(FakeRunner::default()));
        let session = sessions.get_or_create(None).await;

        let turn = session.send("first").await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), session.send("second")).await;
        assert!(blocked.is_err());

        drop(turn);
        let second = session.send("second").await.unwrap();
        drop(second);
        let history = session.history().await;
        assert_eq!(history.first().unwrap().content, "first");
        assert_eq!(history.last().unwrap().content, "second");
    }

    #[tokio::test]
    async fn the_session_stays_readable_during_a_turn() {
        let sessions = manager(Arc::new(FakeRunner::default()));
        let session = sessions.get_or_create(None).await;

        let mut turn = session.send("q").await.unwrap();
        turn.next().await.unwrap().unwrap();

        let wait = Duration::from_millis(200);
        let history = tokio::time::timeout(wait, session.history()).await.unwrap();
        assert_eq!(history.len(), 2);
        tokio::time::timeout(wait, session.summary()).await.unwrap();
        tokio::time::timeout(wait, session.set_context_value("k", Value::Null))
            .await
            .unwrap();
        tokio::time::timeout(wait, session.clear_history()).await.unwrap();

        turn.next().await.unwrap().unwrap();
        assert!(turn.next().await.is_none());
        assert_eq!(contents(&session.history().await), vec![(Role::Assistant, "done")]);
    }

    #[tokio::test]
    async fn history_keeps_only_the_newest_messages() {
        let sessions = manager(Arc::new(FakeRunner::default())).with_max_history(4);
        let session = sessions.get_or_create(None).await;

        session.send("a").await.unwrap().collect().await.unwrap();
        session.send("b").await.unwrap().collect().await.unwrap();
        assert_eq!(
            contents(&session.history().await),
            vec![
                (Role::Assistant, "done"),
                (Role::User, "b"),
                (Role::Assistant, "reply:b"),
                (Role::Assistant, "done"),
            ]
        );

        session.clear_history().await;
        session.send("c").await.unwrap().collect().await.unwrap();
        session.send("d").await.unwrap().collect().await.unwrap();
        assert_eq!(session.history().await.len(), 4);
        assert_eq!(session.max_history(), 4);
    }

    #[tokio::test]
    async fn restored_history_is_capped_too() {
        let sessions = manager(Arc::new(FakeRunner::default())).with_max_history(2);
        let snapshot = SessionSnapshot {
            session_id: "s1".into(),
            options: QueryOptions::default(),
            user: None,
            history: ["1", "2", "3"].map(ConversationMessage::user).to_vec(),
            context_data: Map::new(),
            saved_at: Utc::now(),
        };
        let session = sessions.restore(snapshot).await;
        let history = session.history().await;
        assert_eq!(contents(&history), vec![(Role::User, "2"), (Role::User, "3")]);
    }

    #[tokio::test]
    async fn clear_history_keeps_the_session_id() {
        let sessions = manager(Arc::new(FakeRunner::default()));
        let session = sessions.get_or_create(None).await;
        session.send("x").await.unwrap().collect().await.unwrap();

        session.clear_history().await;
        assert!(session.history().await.is_empty());
        let again = sessions.get(session.id()).await.unwrap();
        assert!(Arc::ptr_eq(&session, &again));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let sessions = manager(Arc::new(FakeRunner::default()));
        let err = sessions.get(&"nope".into()).await.err().unwrap();
        assert!(matches!(err, Error::SessionNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn open_reports_creation_once() {
        let sessions = manager(Arc::new(FakeRunner::default()));
        let (a, created) = sessions.open(Some("s1".into()), None).await;
        assert!(created);
        let (b, created) = sessions.open(Some("s1".into()), None).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));

        let (fresh, _) = sessions.open(None, None).await;
        assert_ne!(fresh.id(), a.id());
        assert_eq!(sessions.ids().await.len(), 2);
        assert!(sessions.remove(a.id()).await);
        assert_eq!(sessions.ids().await, vec![fresh.id().clone()]);
    }

    #[tokio::test]
    async fn user_and_context_data_reach_every_turn() {
        let runner = Arc::new(FakeRunner::default());
        let sessions = manager(Arc::clone(&runner));
        let session = sessions.get_or_create(None).await;
        session
            .set_user(Some(UserInfo {
                id: "u1".into(),
                name: Some("Ada".into()),
                preferences: Map::new(),
            }))
            .await;
        session.set_context_value("project", Value::from("ccq")).await;

        session.send("x").await.unwrap().collect().await.unwrap();
        let contexts = runner.contexts.lock().unwrap();
        assert_eq!(contexts[0].user.as_ref().unwrap().id, "u1");
        assert_eq!(contexts[0].context_data["project"], "ccq");
    }

    #[tokio::test]
    async fn summary_previews_last_message() {
        let sessions = manager(Arc::new(FakeRunner::default()));
        let session = sessions.get_or_create(None).await;
        let long = "y".repeat(150);
        session.send(&long).await.unwrap().collect().await.unwrap();
        session.set_context_value("k", Value::Null).await;

        let summary = session.summary().await;
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.last_message.as_deref(), Some("done"));
        assert_eq!(summary.context_keys, vec!["k".to_string()]);

        session.clear_history().await;
        session.send(&long).await.unwrap();
        let summary = session.summary().await;
        assert_eq!(summary.last_message.unwrap().chars().count(), PREVIEW_CHARS + 3);
    }

    #[tokio::test]
    async fn sessions_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions").join("s1.json");

        let sessions = manager(Arc::new(FakeRunner::default()));
        let session = sessions.get_or_create(Some("s1".into())).await;
        session.send("persist me").await.unwrap().collect().await.unwrap();
        session.set_context_value("lang", Value::from("rust")).await;
        session.save(&path).await.unwrap();

        let other = manager(Arc::new(FakeRunner::default()));
        let restored = other.load(&path).await.unwrap();
        assert_eq!(restored.id(), &SessionId::from("s1"));
        assert_eq!(restored.history().await, session.history().await);
        assert_eq!(restored.snapshot().await.context_data["lang"], "rust");
        assert!(other.get(&"s1".into()).await.is_ok());
    }

    #[tokio::test]
    async fn loading_a_missing_file_is_an_invalid_path() {
        let sessions = manager(Arc::new(FakeRunner::default()));
        let err = sessions
            .load(Path::new("/definitely/not/here.json"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }
}
