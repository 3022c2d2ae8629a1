use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chat_convo::{ActiveGeneration, Message, MessageRole, Session, SessionSummary};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{Notify, Semaphore, mpsc};

use crate::AppState;
use crate::config::{AuthConfig, ChatConfig, RelayConfig};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::models::User;
use crate::multiplexer::Multiplexer;
use crate::repository::ChatRepository;
use crate::source::{EchoSource, FragmentStream, SourceError, StreamSource};
use crate::store::SessionStore;

/// Build a fully-wired `AppState` backed by an in-memory SQLite database and
/// an instant echo source.
///
/// Returns `(AppState, TempDir)`: callers **must** hold the `TempDir` for
/// the lifetime of the test so the data directory stays valid.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    test_app_state_with_source(Arc::new(EchoSource::new(std::time::Duration::ZERO))).await
}

/// Like `test_app_state`, but generations stream from `source`.
pub async fn test_app_state_with_source(
    source: Arc<dyn StreamSource>,
) -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = RelayConfig::new(Some(tmp.path().to_path_buf())).expect("config");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("pragma");

    let db = Arc::new(Database { pool: pool.clone() });
    let repository = Arc::new(ChatRepository::new(pool));
    let metrics = Arc::new(ServerMetrics::new());
    let chat_config = ChatConfig {
        stall_timeout: None,
        ..ChatConfig::default()
    };
    let multiplexer = Multiplexer::new(
        repository.clone(),
        source,
        chat_config.clone(),
        metrics.clone(),
    );

    let state = AppState {
        config: Arc::new(config),
        chat_config: Arc::new(chat_config),
        auth_config: Arc::new(AuthConfig {
            enabled: false,
            session_ttl_secs: 3600,
        }),
        metrics,
        db,
        repository,
        multiplexer,
    };

    (state, tmp)
}

/// Like `test_app_state`, but with auth **enabled** and a user `alice`
/// (password `wonderland`) who is already logged in.
///
/// Returns `(AppState, TempDir, User, token)`.
pub async fn test_app_state_with_auth() -> (AppState, tempfile::TempDir, User, String) {
    let (mut state, tmp) = test_app_state().await;

    state.auth_config = Arc::new(AuthConfig {
        enabled: true,
        session_ttl_secs: 3600,
    });

    let user = User::new(
        "alice",
        "Alice",
        ChatRepository::hash_password("wonderland").expect("hash"),
    );
    state.repository.create_user(&user).await.expect("create user");
    let token = state
        .repository
        .issue_token(&user.id, 3600)
        .await
        .expect("issue token");

    (state, tmp, user, token)
}

// =============================================================================
// In-memory Session Store
// =============================================================================

/// Parks `ensure_session` callers after they have read the session, until opened.
pub struct Gate {
    reached: Notify,
    release: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            reached: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Wait until a caller is parked at the gate.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let every parked and future caller through.
    pub fn open(&self) {
        self.release.close();
    }
}

/// `SessionStore` kept in process memory. Never touches the clock, so it is
/// safe under paused time.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    active: Mutex<HashMap<String, ActiveGeneration>>,
    appends: AtomicUsize,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, session_id: &str) -> Vec<Message> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Number of messages actually appended (duplicates excluded).
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Hold every later `ensure_session` call until the returned gate opens.
    pub fn gate_ensure_session(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.lock().unwrap().get(session_id).cloned())
    }

    async fn ensure_session(
        &self,
        session_id: &str,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<Session> {
        let session = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    let mut session = Session::new(session_id, user_id);
                    session.title = title.map(str::to_string);
                    session
                })
                .clone()
        };
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.reached.notify_one();
            // Closed means open
            let _ = gate.release.acquire().await;
        }
        Ok(session)
    }

    async fn append_final_message(&self, session_id: &str, message: &Message) -> Result<()> {
        if !message.is_final() {
            bail!("refusing to store pending message {}", message.id);
        }
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(session_id) else {
            bail!("no such session: {session_id}");
        };
        if session.contains(&message.id) {
            return Ok(());
        }
        if message.role == MessageRole::User && session.title.is_none() {
            session.title = chat_convo::derive_title(std::slice::from_ref(message));
        }
        session.messages.push(message.clone());
        session.updated_at = Utc::now();
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_active_generation(&self, session_id: &str) -> Result<Option<ActiveGeneration>> {
        Ok(self.active.lock().unwrap().get(session_id).cloned())
    }

    async fn set_active_generation(&self, generation: &ActiveGeneration) -> Result<()> {
        let mut token = generation.clone();
        token.seq = 0;
        token.live = false;
        self.active
            .lock()
            .unwrap()
            .insert(generation.session_id.clone(), token);
        Ok(())
    }

    async fn clear_active_generation(&self, session_id: &str, generation_id: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if active
            .get(session_id)
            .is_some_and(|g| g.generation_id == generation_id)
        {
            active.remove(session_id);
        }
        Ok(())
    }

    async fn clear_orphaned_generations(&self) -> Result<u64> {
        let mut active = self.active.lock().unwrap();
        let cleared = active.len() as u64;
        active.clear();
        Ok(cleared)
    }

    async fn count_user_messages_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let sessions = self.sessions.lock().unwrap();
        let count = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .flat_map(|s| s.messages.iter())
            .filter(|m| m.role == MessageRole::User && m.created_at >= since)
            .count();
        Ok(count as i64)
    }

    async fn list_sessions(&self, user_id: &str, limit: i64) -> Result<Vec<SessionSummary>> {
        let sessions = self.sessions.lock().unwrap();
        let mut summaries: Vec<_> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| SessionSummary {
                id: s.id.clone(),
                title: s.title.clone(),
                message_count: s.messages.len() as i64,
                updated_at: s.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit.max(0) as usize);
        Ok(summaries)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.active.lock().unwrap().remove(session_id);
        Ok(self.sessions.lock().unwrap().remove(session_id).is_some())
    }
}

// =============================================================================
// Scripted Stream Source
// =============================================================================

type Scripted = Result<String, SourceError>;

/// A `StreamSource` whose fragments are pushed by the test. It can be
/// invoked once; a second invocation fails, and `calls` counts both.
pub struct ScriptedSource {
    tx: Mutex<Option<mpsc::UnboundedSender<Scripted>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Scripted>>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn send(&self, delta: &str) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(delta.to_string()));
        }
    }

    /// End the fragment stream normally.
    pub fn finish(&self) {
        self.tx.lock().unwrap().take();
    }

    /// End the fragment stream with `error`.
    pub fn fail(&self, error: SourceError) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(Err(error));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    async fn generate(&self, _transcript: Vec<Message>, _model: &str) -> Result<FragmentStream, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(rx) = self.rx.lock().unwrap().take() else {
            return Err(SourceError::Provider("scripted source already used".into()));
        };
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
