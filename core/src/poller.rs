/// Poll loop: one cooperative timer task per open conversation
///
/// Each session owns its cursor and backoff state. Fetches for one
/// conversation are strictly sequential because a single task drives them;
/// different conversations poll independently.
use crate::backoff::{Backoff, FailureAction};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::fetcher::{max_timestamp, Fetcher};
use crate::timestamp::now_millis;
use crate::types::{ConversationId, Message, MessageId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub type MessagesCallback = Arc<dyn Fn(Vec<Message>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;

const NO_CURSOR: i64 = i64::MIN;

/// State shared between a session's map entry, its task and its handle
struct SessionState {
    active: AtomicBool,
    cursor: AtomicI64,
    wake: Notify,
    /// Held while a callback runs; deactivation waits for it
    gate: Mutex<()>,
}

impl SessionState {
    fn new(initial_since: Option<i64>) -> Self {
        Self {
            active: AtomicBool::new(true),
            cursor: AtomicI64::new(initial_since.unwrap_or(NO_CURSOR)),
            wake: Notify::new(),
            gate: Mutex::new(()),
        }
    }

    fn enter(&self) -> MutexGuard<'_, ()> {
        // A panicking callback poisons the gate, not the session state
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark inactive. Returns only after any in-flight callback has finished.
    fn deactivate(&self) {
        let _gate = self.enter();
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn cursor(&self) -> Option<i64> {
        match self.cursor.load(Ordering::SeqCst) {
            NO_CURSOR => None,
            ms => Some(ms),
        }
    }

    /// Monotonic: the cursor never moves backward
    fn advance_cursor(&self, ms: i64) {
        self.cursor.fetch_max(ms, Ordering::SeqCst);
    }
}

struct PollSession {
    state: Arc<SessionState>,
    task: JoinHandle<()>,
}

impl PollSession {
    fn cancel(self) {
        self.state.deactivate();
        self.task.abort();
    }
}

struct PollerInner {
    fetcher: Fetcher,
    poll_interval: Duration,
    backoff_factor: f64,
    max_retries: u32,
    shutdown_cooldown: Duration,
    sessions: RwLock<HashMap<ConversationId, PollSession>>,
    messaging_active: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_epoch: AtomicU64,
}

/// Owner of every poll session; construct once and share by clone
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    pub fn new(fetcher: Fetcher, config: &Config) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                fetcher,
                poll_interval: config.poll_interval,
                backoff_factor: config.backoff_factor,
                max_retries: config.max_retries,
                shutdown_cooldown: config.shutdown_cooldown,
                sessions: RwLock::new(HashMap::new()),
                messaging_active: AtomicBool::new(true),
                shutting_down: AtomicBool::new(false),
                shutdown_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Start polling a conversation, replacing any session already running for it.
    ///
    /// The first fetch happens immediately. Without `initial_since` that
    /// first fetch is unfiltered; afterwards only messages newer than the
    /// cursor are delivered. Refused while a stop-all cooldown is in effect.
    pub async fn start(
        &self,
        conversation_id: ConversationId,
        on_messages: MessagesCallback,
        initial_since: Option<i64>,
        on_error: Option<ErrorCallback>,
    ) -> Result<PollHandle> {
        conversation_id.validate()?;

        // Checked under the sessions lock: stop_all sets the flag while holding it
        let mut sessions = self.inner.sessions.write().await;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            warn!("Refusing to poll {} while shutting down", conversation_id);
            return Err(SyncError::ShuttingDown);
        }

        let state = Arc::new(SessionState::new(initial_since));
        if let Some(old) = sessions.remove(&conversation_id) {
            debug!("Replacing existing poll session for {}", conversation_id);
            old.cancel();
        }

        let task = tokio::spawn(run_session(
            self.inner.clone(),
            conversation_id.clone(),
            state.clone(),
            on_messages,
            on_error,
        ));
        sessions.insert(
            conversation_id.clone(),
            PollSession {
                state: state.clone(),
                task,
            },
        );
        info!("Started polling conversation {}", conversation_id);

        Ok(PollHandle {
            poller: self.clone(),
            conversation_id,
            state,
        })
    }

    /// Stop one session; late fetch completions for it are ignored
    pub async fn stop(&self, conversation_id: &ConversationId) -> bool {
        let removed = self.inner.sessions.write().await.remove(conversation_id);
        match removed {
            Some(session) => {
                session.cancel();
                info!("Stopped polling conversation {}", conversation_id);
                true
            }
            None => false,
        }
    }

    /// Stop every session and refuse new ones for the shutdown cooldown
    pub async fn stop_all(&self) {
        let (epoch, drained) = {
            let mut sessions = self.inner.sessions.write().await;
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            let epoch = self.inner.shutdown_epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let drained: Vec<_> = sessions.drain().collect();
            (epoch, drained)
        };
        let count = drained.len();
        for (_, session) in drained {
            session.cancel();
        }
        info!("Stopped all polling ({} sessions)", count);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            sleep(inner.shutdown_cooldown).await;
            // A later stop_all owns the window now
            if inner.shutdown_epoch.load(Ordering::SeqCst) == epoch {
                inner.shutting_down.store(false, Ordering::SeqCst);
                debug!("Shutdown cooldown elapsed");
            }
        });
    }

    /// Fetch now instead of waiting for the timer.
    ///
    /// If a fetch is in flight the forced one runs right after it.
    pub async fn force_poll(&self, conversation_id: &ConversationId) -> bool {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(conversation_id) {
            Some(session) => {
                session.state.wake.notify_one();
                true
            }
            None => {
                debug!("force_poll: no session for {}", conversation_id);
                false
            }
        }
    }

    /// Suspend or resume all polling without discarding cursors
    pub async fn set_active(&self, active: bool) {
        let was = self.inner.messaging_active.swap(active, Ordering::SeqCst);
        if was == active {
            return;
        }
        info!("Messaging {}", if active { "resumed" } else { "suspended" });
        if active {
            for session in self.inner.sessions.read().await.values() {
                session.state.wake.notify_one();
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.messaging_active.load(Ordering::SeqCst)
    }

    pub async fn is_polling(&self, conversation_id: &ConversationId) -> bool {
        self.inner.sessions.read().await.contains_key(conversation_id)
    }

    pub async fn active_sessions(&self) -> Vec<ConversationId> {
        self.inner.sessions.read().await.keys().cloned().collect()
    }

    /// Current cursor (epoch millis) of a session
    pub async fn cursor(&self, conversation_id: &ConversationId) -> Option<i64> {
        self.inner
            .sessions
            .read()
            .await
            .get(conversation_id)
            .and_then(|s| s.state.cursor())
    }
}

/// Returned by `Poller::start`; stops exactly the session it was issued for
pub struct PollHandle {
    poller: Poller,
    conversation_id: ConversationId,
    state: Arc<SessionState>,
}

impl PollHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Stop this session. A newer session for the same id is left alone.
    pub async fn stop(self) -> bool {
        let mut sessions = self.poller.inner.sessions.write().await;
        let owned = sessions
            .get(&self.conversation_id)
            .is_some_and(|s| Arc::ptr_eq(&s.state, &self.state));
        if owned {
            if let Some(session) = sessions.remove(&self.conversation_id) {
                session.cancel();
                info!("Stopped polling conversation {}", self.conversation_id);
            }
        }
        self.state.deactivate();
        owned
    }
}

/// Identity of an already-delivered message whose timestamp was unusable
#[derive(Debug, PartialEq, Eq, Hash)]
enum UnparsedKey {
    Id(MessageId),
    Body(UserId, String),
}

impl UnparsedKey {
    fn of(message: &Message) -> Self {
        match message.id {
            Some(id) => UnparsedKey::Id(id),
            None => UnparsedKey::Body(message.sender_id, message.content.clone()),
        }
    }
}

async fn run_session(
    inner: Arc<PollerInner>,
    conversation_id: ConversationId,
    state: Arc<SessionState>,
    on_messages: MessagesCallback,
    on_error: Option<ErrorCallback>,
) {
    let mut backoff = Backoff::new(inner.poll_interval, inner.backoff_factor, inner.max_retries);
    let started_at = now_millis();
    // Messages without a usable timestamp can't be filtered by cursor
    let mut delivered_unparsed: HashSet<UnparsedKey> = HashSet::new();
    let mut immediate = true;

    loop {
        if !immediate {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = state.wake.notified() => {
                    debug!("Forced poll for {}", conversation_id);
                }
            }
        }
        immediate = false;

        if !state.is_active() {
            break;
        }
        if !inner.messaging_active.load(Ordering::SeqCst) {
            continue;
        }

        let since = state.cursor();
        match inner.fetcher.fetch_since(&conversation_id, since).await {
            Ok(batch) => {
                let batch: Vec<Message> = batch
                    .into_iter()
                    .filter(|m| m.timestamp.parsed || delivered_unparsed.insert(UnparsedKey::of(m)))
                    .collect();

                match max_timestamp(&batch) {
                    Some(max) => state.advance_cursor(max),
                    None if since.is_none() => state.advance_cursor(started_at),
                    None => {}
                }
                if batch.is_empty() {
                    continue;
                }

                backoff.on_success();
                let _gate = state.enter();
                if !state.is_active() {
                    debug!("Dropping batch for stopped session {}", conversation_id);
                    break;
                }
                debug!(
                    "Conversation {}: delivering {} new messages",
                    conversation_id,
                    batch.len()
                );
                on_messages(batch);
            }
            Err(e) => match backoff.on_failure() {
                FailureAction::Retry { retry, delay } => {
                    if e.is_transient() {
                        warn!(
                            "Poll failed for {} (retry {}/{}), next in {:?}: {}",
                            conversation_id, retry, inner.max_retries, delay, e
                        );
                    } else {
                        // Retrying won't help until the backend or its data changes
                        error!(
                            "Poll rejected for {} (retry {}/{}), next in {:?}: {}",
                            conversation_id, retry, inner.max_retries, delay, e
                        );
                    }
                    if let Some(cb) = &on_error {
                        let _gate = state.enter();
                        if state.is_active() {
                            cb(&e);
                        }
                    }
                }
                FailureAction::Cooldown { delay } => {
                    warn!(
                        "Poll for {} keeps failing, cooling down for {:?}: {}",
                        conversation_id, delay, e
                    );
                }
            },
        }
    }
    debug!("Poll task for {} exited", conversation_id);
}
