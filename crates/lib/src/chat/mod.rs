//! Streaming reconciler: owns conversation state, routes each send (local simulation,
//! backend, or offline outbox), streams the reply through the primary transport with a
//! single fallback, and writes every status transition to the durable store.
//!
//! State is published as a [`ChatSnapshot`] on a watch channel after every mutation.

mod guest;
mod state;

pub use guest::demo_reply;
pub use state::{ChatSnapshot, Conversation};

use crate::api::{ApiClient, ApiError, ChatBackend, MessagePayload};
use crate::config::{self, Config};
use crate::connectivity::{Connectivity, Subscription};
use crate::message::{
    new_id, Attachment, Message, MessageId, Role, Status, ThreadId, ThreadRef, DEFAULT_THREAD_TITLE,
};
use crate::mode::{Mode, Route};
use crate::outbox::{Outbox, ReplayObserver, SyncReport};
use crate::store::{OutboxEntry, PersistedMessage, Store, StoreError};
use crate::stream::{chunked_path, socket_path, SocketStream, StreamEnd, TokenTransport};
use anyhow::Context;
use async_trait::async_trait;
use state::ChatState;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Assistant content shown while a message waits in the outbox.
pub const QUEUED_NOTICE: &str = "Offline: message queued. It will be sent when the connection returns.";

/// Prefix of the assistant content when a send fails.
pub const ERROR_PREFIX: &str = "⚠ Error:";

const STOPPED_REASON: &str = "stopped before any reply arrived";
const TITLE_CHARS: usize = 40;

/// Collaborators the reconciler is built from.
pub struct ChatDeps {
    pub mode: Mode,
    pub backend: Arc<dyn ChatBackend>,
    /// Chunked-response reader.
    pub primary: Arc<dyn TokenTransport>,
    /// Persistent socket, opened at most once per reply.
    pub fallback: Arc<dyn TokenTransport>,
    pub store: Store,
    pub connectivity: Arc<Connectivity>,
    pub workspace_id: Option<String>,
    /// Pacing of simulated tokens in guest mode.
    pub guest_tick: Duration,
}

pub struct Chat {
    mode: Mode,
    backend: Arc<dyn ChatBackend>,
    primary: Arc<dyn TokenTransport>,
    fallback: Arc<dyn TokenTransport>,
    store: Store,
    outbox: Outbox,
    net: Arc<Connectivity>,
    workspace_id: Option<String>,
    guest_tick: Duration,
    state: Mutex<ChatState>,
    snapshot: watch::Sender<ChatSnapshot>,
    session_cancel: Mutex<CancellationToken>,
    sync_started: AtomicBool,
    lanes: Lanes,
    /// Held for reading by streaming sends and for writing by outbox replay.
    replay_gate: RwLock<()>,
}

/// Work for one send after the user message has been persisted.
struct SendJob {
    route: Route,
    thread: ThreadId,
    provisional: bool,
    user_id: MessageId,
    reply: Message,
    content: String,
    created_at: i64,
    attachments: Vec<Attachment>,
    cancel: CancellationToken,
    /// Place in the thread's lane; streaming routes only.
    turn: Option<Turn>,
}

/// Position of one streaming send in its thread's lane.
struct Turn {
    /// Resolves once the previous send in the thread has finished.
    after: Option<oneshot::Receiver<()>>,
    /// Dropped when this send finishes, releasing the next one.
    _release: oneshot::Sender<()>,
}

/// Per-thread FIFO of streaming sends: each send waits for the one queued before it, so at most
/// one reply per thread is open and posts reach the backend in send order.
#[derive(Default)]
struct Lanes(Mutex<HashMap<ThreadId, oneshot::Receiver<()>>>);

impl Lanes {
    fn join(&self, thread: &str) -> Turn {
        let (tx, rx) = oneshot::channel();
        let after = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread.to_string(), rx);
        Turn {
            after,
            _release: tx,
        }
    }

    /// Sends queued under a provisional id keep their order under the backend id.
    fn rebind(&self, from: &str, to: &str) {
        let mut g = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tail) = g.remove(from) {
            g.entry(to.to_string()).or_insert(tail);
        }
    }
}

/// How a reply stream ended.
enum Outcome {
    Done,
    Stopped,
    Failed(String),
}

/// Decrements the streaming counter when a reply finishes, however it finishes.
struct Streaming<'a>(&'a Chat);

impl<'a> Streaming<'a> {
    fn begin(chat: &'a Chat) -> Self {
        chat.update(|s| s.streams += 1);
        Self(chat)
    }

    /// Counter was already incremented by the caller.
    fn adopt(chat: &'a Chat) -> Self {
        Self(chat)
    }
}

impl Drop for Streaming<'_> {
    fn drop(&mut self) {
        self.0.update(|s| s.streams = s.streams.saturating_sub(1));
    }
}

impl Chat {
    pub fn new(deps: ChatDeps) -> Arc<Self> {
        let state = ChatState::default();
        let (tx, _rx) = watch::channel(state.snapshot());
        Arc::new(Self {
            mode: deps.mode,
            backend: deps.backend,
            primary: deps.primary,
            fallback: deps.fallback,
            outbox: Outbox::new(deps.store.outbox.clone()),
            store: deps.store,
            net: deps.connectivity,
            workspace_id: deps.workspace_id,
            guest_tick: deps.guest_tick,
            state: Mutex::new(state),
            snapshot: tx,
            session_cancel: Mutex::new(CancellationToken::new()),
            sync_started: AtomicBool::new(false),
            lanes: Lanes::default(),
            replay_gate: RwLock::new(()),
        })
    }

    /// Wire the HTTP client, transports and on-disk store from config, resolving the mode once.
    /// With `force_guest` the session probe is skipped.
    pub async fn connect(
        config: &Config,
        config_path: &Path,
        force_guest: bool,
    ) -> anyhow::Result<(Arc<Self>, ApiClient)> {
        let api = ApiClient::from_config(config).context("building api client")?;
        let mode = if force_guest {
            Mode::Guest
        } else {
            Mode::resolve(&api).await
        };
        let data_dir = config::resolve_data_dir(config, config_path);
        let store = Store::open(&data_dir)
            .await
            .with_context(|| format!("opening data directory {}", data_dir.display()))?;
        let ws_base = config::resolve_ws_base(config)
            .or_else(|| config::derive_ws_base(api.base_url()))
            .with_context(|| format!("cannot derive websocket base from {}", api.base_url()))?;
        let workspace_id = config::resolve_workspace_id(config);
        let socket = SocketStream::new(ws_base, config.stream.reconnect.policy())
            .with_workspace(workspace_id.clone())
            .with_auth_token(config::resolve_auth_token(config));
        let online = match mode {
            Mode::Guest => true,
            Mode::User(_) => api.ping().await,
        };
        let chat = Self::new(ChatDeps {
            mode,
            backend: Arc::new(api.clone()),
            primary: Arc::new(api.chunked_reader()),
            fallback: Arc::new(socket),
            store,
            connectivity: Connectivity::new(online),
            workspace_id,
            guest_tick: Duration::from_millis(config.guest.tick_ms),
        });
        if let Err(e) = chat.load_threads().await {
            log::warn!("chat: could not restore threads: {}", e);
        }
        Ok((chat, api))
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.net
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn active_thread(&self) -> Option<ThreadId> {
        self.read(|s| s.active.clone())
    }

    pub fn threads(&self) -> Vec<ThreadRef> {
        self.read(|s| s.threads.clone())
    }

    fn update<T>(&self, f: impl FnOnce(&mut ChatState) -> T) -> T {
        let mut g = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut g);
        self.snapshot.send_replace(g.snapshot());
        out
    }

    fn read<T>(&self, f: impl FnOnce(&ChatState) -> T) -> T {
        let g = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&g)
    }

    fn current_cancel(&self) -> CancellationToken {
        self.session_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    /// Rebuild the thread list from the durable store (newest first).
    pub async fn load_threads(&self) -> Result<usize, StoreError> {
        let records = self.store.messages.list_all().await?;
        let waiting: Vec<OutboxEntry> = self.outbox.list_all().await?;
        let mut found: BTreeMap<ThreadId, ThreadRef> = BTreeMap::new();
        for r in records.iter().filter(|r| self.in_scope(r.workspace_id.as_deref())) {
            let t = found.entry(r.thread_id.clone()).or_insert_with(|| {
                let mut t = ThreadRef::new(r.thread_id.clone());
                t.created_at = r.created_at;
                t.provisional = waiting
                    .iter()
                    .any(|e| e.thread_id == r.thread_id && e.needs_thread);
                t
            });
            if t.title == DEFAULT_THREAD_TITLE && r.role == Role::User {
                t.title = title_from(&r.content);
            }
        }
        let mut threads: Vec<ThreadRef> = found.into_values().collect();
        threads.sort_by_key(|t| t.created_at);
        let n = threads.len();
        self.update(|s| {
            for t in threads {
                s.add_thread(t);
            }
        });
        Ok(n)
    }

    fn in_scope(&self, workspace_id: Option<&str>) -> bool {
        match (&self.workspace_id, workspace_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    async fn load_conversation(&self, thread_id: &str) -> Result<Conversation, StoreError> {
        let records = self.store.messages.get_all_by_thread(thread_id).await?;
        let messages = records
            .into_iter()
            .filter(|r| self.in_scope(r.workspace_id.as_deref()))
            .map(PersistedMessage::into_message)
            .collect();
        Ok(Conversation::from_messages(messages))
    }

    /// Start a new thread and make it active. Offline in user mode the thread is provisional.
    pub async fn new_thread(&self) -> Result<ThreadId, ApiError> {
        let thread = match Route::select(&self.mode, self.net.is_online()) {
            Route::Local => ThreadRef::new(new_id()),
            Route::BackendOnline => ThreadRef::new(self.backend.create_thread().await?),
            Route::BackendOffline => provisional_thread(),
        };
        let id = thread.thread_id.clone();
        log::info!("chat: new thread {}", id);
        self.update(|s| {
            s.add_thread(thread);
            s.conversation_mut(&id);
            s.active = Some(id.clone());
            s.last_error = None;
        });
        Ok(id)
    }

    /// Make `thread_id` active, hydrating its messages from the store if not loaded yet.
    pub async fn set_thread(&self, thread_id: &str) -> Result<(), StoreError> {
        let loaded = self.read(|s| s.conversations.contains_key(thread_id));
        let conversation = if loaded {
            None
        } else {
            Some(self.load_conversation(thread_id).await?)
        };
        self.update(|s| {
            if let Some(c) = conversation {
                s.conversations.entry(thread_id.to_string()).or_insert(c);
            }
            if !s.has_thread(thread_id) {
                s.add_thread(ThreadRef::new(thread_id));
            }
            s.active = Some(thread_id.to_string());
            s.last_error = None;
        });
        Ok(())
    }

    /// Returns false when the thread is unknown.
    pub fn rename_thread(&self, thread_id: &str, title: &str) -> bool {
        self.update(|s| match s.threads.iter_mut().find(|t| t.thread_id == thread_id) {
            Some(t) => {
                t.title = title.trim().to_string();
                true
            }
            None => false,
        })
    }

    /// Empty the active thread in memory and delete its stored messages.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let Some(thread) = self.active_thread() else {
            return Ok(());
        };
        self.update(|s| {
            s.conversations.insert(thread.clone(), Conversation::default());
            s.last_error = None;
        });
        self.store.messages.delete_by_thread(&thread).await
    }

    /// Send a user message. Returns once the user message is stored; the reply is produced by
    /// the returned task. Empty content without attachments is ignored (`None`).
    pub async fn send_message(
        self: &Arc<Self>,
        thread_id: Option<&str>,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Option<JoinHandle<()>> {
        if content.trim().is_empty() && attachments.is_empty() {
            return None;
        }
        if let Some(t) = thread_id {
            if !self.read(|s| s.conversations.contains_key(t)) {
                if let Err(e) = self.set_thread(t).await {
                    log::warn!("chat: could not load thread {}: {}", t, e);
                }
            }
        }

        let route = Route::select(&self.mode, self.net.is_online());
        let user = Message::user(content);
        let reply = Message::assistant_placeholder();
        let (thread, provisional) = self.update(|s| {
            let id = match thread_id.map(str::to_string).or_else(|| s.active.clone()) {
                Some(id) => id,
                None => {
                    let t = match route {
                        Route::Local => ThreadRef::new(new_id()),
                        _ => provisional_thread(),
                    };
                    let id = t.thread_id.clone();
                    s.add_thread(t);
                    id
                }
            };
            if !s.has_thread(&id) {
                s.add_thread(ThreadRef::new(id.clone()));
            }
            let mut provisional = false;
            if let Some(t) = s.threads.iter_mut().find(|t| t.thread_id == id) {
                if t.title == DEFAULT_THREAD_TITLE {
                    t.title = title_from(content);
                }
                provisional = t.provisional;
            }
            let c = s.conversation_mut(&id);
            c.push(user.clone());
            if route == Route::BackendOffline {
                c.push(reply.clone());
            } else {
                // The placeholder opens when the send's turn in the thread comes.
                s.streams += 1;
            }
            s.active = Some(id.clone());
            s.last_error = None;
            (id, provisional)
        });
        let turn = (route != Route::BackendOffline).then(|| self.lanes.join(&thread));
        self.persist_message(&thread, &user).await;

        let job = SendJob {
            route,
            thread,
            provisional,
            user_id: user.id,
            reply,
            content: content.to_string(),
            created_at: user.created_at,
            attachments,
            cancel: self.current_cancel(),
            turn,
        };
        log::debug!("chat: send {} via {:?} on thread {}", job.user_id, route, job.thread);
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run(job).await }))
    }

    /// Cancel every in-flight reply. Content already appended stays.
    pub fn stop(&self) {
        let mut g = self
            .session_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        g.cancel();
        *g = CancellationToken::new();
        log::info!("chat: stop requested");
    }

    /// Send the content of an earlier user message again, in the same thread.
    pub async fn retry_message(self: &Arc<Self>, message_id: &str) -> Option<JoinHandle<()>> {
        let (thread, content) = self.read(|s| {
            let thread = s.thread_of(message_id)?.clone();
            let m = s.conversations.get(&thread)?.get(message_id)?;
            (m.role == Role::User).then(|| (thread, m.content.clone()))
        })?;
        log::info!("chat: retry {} in thread {}", message_id, thread);
        self.send_message(Some(&thread), &content, Vec::new()).await
    }

    /// Replay the outbox if in user mode and online. Waits for replies already streaming;
    /// sends made during the replay wait for it.
    pub async fn sync_offline_queue(&self) -> SyncReport {
        if self.mode.is_guest() || !self.net.is_online() {
            return SyncReport::default();
        }
        let _gate = self.replay_gate.write().await;
        self.outbox.sync(self.backend.as_ref(), self).await
    }

    /// Replay the outbox on every offline-to-online transition. Only the first call registers.
    pub fn start_background_sync(self: &Arc<Self>) -> Option<Subscription> {
        if self.sync_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::runtime::Handle::current();
        Some(self.net.on_online_change(move |online| {
            if !online {
                return;
            }
            if let Some(chat) = weak.upgrade() {
                handle.spawn(async move {
                    chat.sync_offline_queue().await;
                });
            }
        }))
    }

    async fn run(&self, job: SendJob) {
        match job.route {
            Route::Local => self.run_local(job).await,
            Route::BackendOffline => self.run_offline(job).await,
            Route::BackendOnline => self.run_online(job).await,
        }
    }

    /// Wait for earlier sends in the job's thread and for a running replay, then open the reply
    /// placeholder. Returns None when the send was stopped while waiting.
    async fn take_turn(&self, job: &mut SendJob) -> Option<RwLockReadGuard<'_, ()>> {
        let mut after = job.turn.as_mut().and_then(|t| t.after.take());
        let wait = async {
            if let Some(previous) = after.as_mut() {
                // An error only means the previous send's task is gone; either way it is over.
                let _ = previous.await;
            }
            after = None;
            self.replay_gate.read().await
        };
        let gate = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => None,
            gate = wait => Some(gate),
        };
        // Whatever stopped this send stopped the earlier ones too; keep the order on release.
        if let Some(previous) = after {
            let _ = previous.await;
        }
        let (thread, provisional) = self.update(|s| {
            let thread = s.current_id(&job.thread);
            let provisional = s.is_provisional(&thread);
            s.conversation_mut(&thread)
                .insert_after(&job.user_id, job.reply.clone());
            (thread, provisional)
        });
        job.provisional = job.provisional && provisional;
        job.thread = thread;
        gate
    }

    async fn run_local(&self, mut job: SendJob) {
        let _streaming = Streaming::adopt(self);
        let Some(_gate) = self.take_turn(&mut job).await else {
            self.stopped_while_waiting(&job).await;
            return;
        };
        let reply = guest::demo_reply(&job.content);
        let mut stopped = false;
        for (i, piece) in guest::Pieces::new(&reply).enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = job.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.guest_tick) => {}
                }
            }
            if job.cancel.is_cancelled() {
                stopped = true;
                break;
            }
            self.append_token(&job.thread, &job.reply.id, piece);
        }
        self.update(|s| s.conversation_mut(&job.thread).set_status(&job.user_id, Status::Sent));
        let outcome = if stopped { Outcome::Stopped } else { Outcome::Done };
        self.finish(&job.thread, None, &job.reply.id, outcome);
        self.persist_thread(&job.thread).await;
    }

    async fn run_offline(&self, job: SendJob) {
        let entry = OutboxEntry {
            id: job.user_id.clone(),
            thread_id: job.thread.clone(),
            workspace_id: self.workspace_id.clone(),
            content: job.content.clone(),
            created_at: job.created_at,
            attachments: job.attachments,
            reply_id: Some(job.reply.id.clone()),
            needs_thread: job.provisional,
        };
        match self.outbox.enqueue(entry).await {
            Ok(()) => self.update(|s| {
                if let Some(m) = s.conversation_mut(&job.thread).get_mut(&job.reply.id) {
                    m.content = QUEUED_NOTICE.to_string();
                }
            }),
            Err(e) => {
                log::warn!("chat: could not queue {}: {}", job.user_id, e);
                let reason = format!("could not queue message: {}", e);
                self.finish(
                    &job.thread,
                    Some(job.user_id.as_str()),
                    &job.reply.id,
                    Outcome::Failed(reason),
                );
            }
        }
        self.persist_thread(&job.thread).await;
    }

    async fn run_online(&self, mut job: SendJob) {
        let _streaming = Streaming::adopt(self);
        let Some(_gate) = self.take_turn(&mut job).await else {
            self.stopped_while_waiting(&job).await;
            return;
        };
        let mut thread = job.thread.clone();

        if job.provisional {
            match self.backend.create_thread().await {
                Ok(real) => {
                    self.rebind_thread(&thread, &real).await;
                    thread = real;
                }
                Err(e) => {
                    log::warn!("chat: thread creation failed: {}", e);
                    let user_id = Some(job.user_id.as_str());
                    self.finish(&thread, user_id, &job.reply.id, Outcome::Failed(e.to_string()));
                    self.persist_thread(&thread).await;
                    return;
                }
            }
        }

        let payload = MessagePayload::new(job.content.clone(), &job.attachments);
        if let Err(e) = self.backend.post_message(&thread, &payload).await {
            log::warn!("chat: post failed for {}: {}", job.user_id, e);
            let user_id = Some(job.user_id.as_str());
            self.finish(&thread, user_id, &job.reply.id, Outcome::Failed(e.to_string()));
            self.persist_thread(&thread).await;
            return;
        }
        self.update(|s| s.conversation_mut(&thread).set_status(&job.user_id, Status::Sent));
        self.persist_thread(&thread).await;

        let outcome = self.stream_reply(&thread, &job.reply.id, &job.cancel).await;
        self.finish(&thread, Some(job.user_id.as_str()), &job.reply.id, outcome);
        self.persist_thread(&thread).await;
    }

    async fn stopped_while_waiting(&self, job: &SendJob) {
        log::debug!("chat: send {} stopped before its turn", job.user_id);
        let user_id = Some(job.user_id.as_str());
        self.finish(&job.thread, user_id, &job.reply.id, Outcome::Stopped);
        self.persist_thread(&job.thread).await;
    }

    /// Primary transport, then the fallback exactly once if the primary failed.
    async fn stream_reply(&self, thread: &str, reply_id: &str, cancel: &CancellationToken) -> Outcome {
        let primary_cancel = cancel.child_token();
        let first = self
            .stream_via(self.primary.as_ref(), &chunked_path(thread), thread, reply_id, &primary_cancel)
            .await;
        primary_cancel.cancel();
        match first {
            Ok(StreamEnd::Done) => return Outcome::Done,
            Ok(StreamEnd::Cancelled) => return Outcome::Stopped,
            Err(_) if cancel.is_cancelled() => return Outcome::Stopped,
            Err(e) => log::warn!(
                "chat: {} stream failed for thread {}, trying {}: {}",
                self.primary.name(),
                thread,
                self.fallback.name(),
                e
            ),
        }

        // The fallback delivers the whole reply; drop any partial primary output.
        self.update(|s| {
            if let Some(m) = s.conversation_mut(thread).get_mut(reply_id) {
                m.content.clear();
            }
        });
        match self
            .stream_via(self.fallback.as_ref(), &socket_path(thread), thread, reply_id, cancel)
            .await
        {
            Ok(StreamEnd::Done) => Outcome::Done,
            Ok(StreamEnd::Cancelled) => Outcome::Stopped,
            Err(_) if cancel.is_cancelled() => Outcome::Stopped,
            Err(e) => {
                log::warn!("chat: {} stream failed for thread {}: {}", self.fallback.name(), thread, e);
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn stream_via(
        &self,
        transport: &dyn TokenTransport,
        path: &str,
        thread: &str,
        reply_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, crate::stream::StreamError> {
        let mut on_token = |token: &str| self.append_token(thread, reply_id, token);
        transport.stream(path, &mut on_token, cancel).await
    }

    fn append_token(&self, thread: &str, reply_id: &str, token: &str) {
        self.update(|s| {
            if !s.conversation_mut(thread).append(reply_id, token) {
                log::debug!("chat: dropped token for missing message {}", reply_id);
            }
        });
    }

    /// Final status of a reply (and of the user message on failure, when given).
    fn finish(&self, thread: &str, user_id: Option<&str>, reply_id: &str, outcome: Outcome) {
        self.update(|s| {
            let c = s.conversation_mut(thread);
            match outcome {
                Outcome::Done => c.set_status(reply_id, Status::Sent),
                Outcome::Stopped => {
                    // A user message that never reached the backend can be retried.
                    if let Some(m) = user_id.and_then(|id| c.get_mut(id)) {
                        if m.status == Status::Pending {
                            m.status = Status::Error;
                        }
                    }
                    if let Some(m) = c.get_mut(reply_id) {
                        if m.content.is_empty() {
                            m.content = format!("{} {}", ERROR_PREFIX, STOPPED_REASON);
                            m.status = Status::Error;
                        } else {
                            m.status = Status::Sent;
                        }
                    }
                }
                Outcome::Failed(reason) => {
                    if let Some(id) = user_id {
                        c.set_status(id, Status::Error);
                    }
                    if let Some(m) = c.get_mut(reply_id) {
                        m.content = format!("{} {}", ERROR_PREFIX, reason);
                        m.status = Status::Error;
                    }
                    s.last_error = Some(reason);
                }
            }
        });
    }

    /// Move a provisional thread to its backend id in memory, in the store and in the outbox.
    async fn rebind_thread(&self, from: &str, to: &str) {
        self.update(|s| s.rebind(from, to));
        self.lanes.rebind(from, to);
        match self.store.messages.get_all_by_thread(from).await {
            Ok(records) => {
                let moved: Vec<PersistedMessage> = records
                    .into_iter()
                    .map(|mut r| {
                        r.thread_id = to.to_string();
                        r
                    })
                    .collect();
                if let Err(e) = self.store.messages.put_many(moved).await {
                    log::warn!("chat: could not rebind stored messages of {}: {}", from, e);
                }
            }
            Err(e) => log::warn!("chat: could not read stored messages of {}: {}", from, e),
        }
        if let Err(e) = self.outbox.retarget(from, to).await {
            log::warn!("chat: could not retarget queued messages of {}: {}", from, e);
        }
        log::info!("chat: thread {} is now {}", from, to);
    }

    async fn persist_message(&self, thread: &str, message: &Message) {
        let record = PersistedMessage::from_message(message, thread, self.workspace_id.as_deref());
        if let Err(e) = self.store.messages.put(record).await {
            log::warn!("chat: could not persist message {}: {}", message.id, e);
        }
    }

    /// Write the thread's full in-memory message list.
    async fn persist_thread(&self, thread: &str) {
        let records: Vec<PersistedMessage> = self.read(|s| {
            s.conversations
                .get(thread)
                .map(|c| {
                    c.messages()
                        .iter()
                        .map(|m| PersistedMessage::from_message(m, thread, self.workspace_id.as_deref()))
                        .collect()
                })
                .unwrap_or_default()
        });
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.store.messages.put_many(records).await {
            log::warn!("chat: could not persist thread {}: {}", thread, e);
        }
    }

    /// Make sure a thread touched by replay is in memory without changing the active thread.
    async fn ensure_loaded(&self, thread: &str) {
        if self.read(|s| s.conversations.contains_key(thread)) {
            return;
        }
        match self.load_conversation(thread).await {
            Ok(c) => self.update(|s| {
                s.conversations.entry(thread.to_string()).or_insert(c);
                if !s.has_thread(thread) {
                    s.add_thread(ThreadRef::new(thread));
                }
            }),
            Err(e) => log::warn!("chat: could not load thread {}: {}", thread, e),
        }
    }
}

#[async_trait]
impl ReplayObserver for Chat {
    async fn thread_created(&self, provisional: &str, real: &str) {
        self.rebind_thread(provisional, real).await;
    }

    async fn replayed(&self, entry: &OutboxEntry) {
        let thread = entry.thread_id.as_str();
        self.ensure_loaded(thread).await;
        self.update(|s| s.conversation_mut(thread).set_status(&entry.id, Status::Sent));
        self.persist_thread(thread).await;

        let Some(reply_id) = entry.reply_id.as_deref() else {
            return;
        };
        let present = self.update(|s| match s.conversation_mut(thread).get_mut(reply_id) {
            Some(m) => {
                m.content.clear();
                m.status = Status::Pending;
                true
            }
            None => false,
        });
        if !present {
            return;
        }
        let _streaming = Streaming::begin(self);
        let cancel = self.current_cancel();
        let outcome = self.stream_reply(thread, reply_id, &cancel).await;
        self.finish(thread, None, reply_id, outcome);
        self.persist_thread(thread).await;
    }
}

fn provisional_thread() -> ThreadRef {
    let mut t = ThreadRef::new(format!("local-{}", new_id()));
    t.provisional = true;
    t
}

/// Thread title from the first user message: first line, bounded length.
fn title_from(content: &str) -> String {
    let line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.is_empty() {
        return DEFAULT_THREAD_TITLE.to_string();
    }
    let mut title: String = line.chars().take(TITLE_CHARS).collect();
    if line.chars().count() > TITLE_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_uses_first_non_empty_line() {
        assert_eq!(title_from("\n  hello there\nsecond"), "hello there");
        assert_eq!(title_from("   "), DEFAULT_THREAD_TITLE);
        let long = "x".repeat(60);
        assert_eq!(title_from(&long).chars().count(), TITLE_CHARS + 1);
    }
}
