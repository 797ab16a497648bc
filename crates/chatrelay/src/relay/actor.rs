//! Per-session relay task and the handle used to reach it.

use anyhow::{Context, Result, anyhow};
use chatrelay_protocol::{ClientCommand, Role, ServerEvent, SessionSnapshot};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::RelaySettings;
use super::pipeline::{STREAM_ERROR_PLACEHOLDER, build_turns, generate_reply};
use crate::inference::{InferenceBackend, is_valid_model_id};
use crate::session::{SessionInfo, SessionStateManager};
use crate::store::SessionStore;

/// Size of the per-session request queue.
const REQUEST_QUEUE_SIZE: usize = 64;

/// Lifecycle phase of a session relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPhase {
    /// Persisted log not loaded yet.
    Hydrating,
    Idle,
    /// A reply is being streamed.
    Generating,
}

impl fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayPhase::Hydrating => write!(f, "hydrating"),
            RelayPhase::Idle => write!(f, "idle"),
            RelayPhase::Generating => write!(f, "generating"),
        }
    }
}

/// What a newly attached connection receives.
pub struct Attachment {
    /// State to send as the connection's `ready` event.
    pub snapshot: SessionSnapshot,
    /// Every event published after the snapshot was taken.
    pub events: broadcast::Receiver<ServerEvent>,
}

enum RelayRequest {
    Attach(oneshot::Sender<Result<Attachment>>),
    Command(ClientCommand),
    Inspect(oneshot::Sender<Result<SessionInfo>>),
    Settle(oneshot::Sender<()>),
}

/// Work that must wait for the current generation to finish.
enum Deferred {
    Command(ClientCommand),
    Settle(oneshot::Sender<()>),
}

/// Called when a relay has been idle for its timeout. Returns whether the
/// relay was released and should expect its request channel to close.
pub(crate) type ReleaseFn = Box<dyn Fn() -> bool + Send + Sync>;

/// Cloneable handle to a running session relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    session_id: Arc<str>,
    requests: mpsc::Sender<RelayRequest>,
    phase: watch::Receiver<RelayPhase>,
}

impl RelayHandle {
    /// Start the relay task for `session_id`. `release` is consulted each
    /// time the relay has been idle for [`RelaySettings::idle_timeout`].
    pub(crate) fn spawn(
        session_id: &str,
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn InferenceBackend>,
        settings: Arc<RelaySettings>,
        release: ReleaseFn,
    ) -> Self {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (phase_tx, phase) = watch::channel(RelayPhase::Hydrating);
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));

        let relay = Relay {
            manager: SessionStateManager::new(
                session_id,
                store,
                settings.default_model.clone(),
                settings.session_ttl,
            ),
            backend,
            settings,
            events,
            phase: phase_tx,
            deferred: VecDeque::new(),
            generation: None,
            release,
        };
        tokio::spawn(relay.run(rx));

        Self {
            session_id: Arc::from(session_id),
            requests,
            phase,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> RelayPhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<RelayPhase> {
        self.phase.clone()
    }

    /// Whether the relay task has stopped.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Whether this is the only handle to the relay.
    pub(crate) fn is_sole_handle(&self) -> bool {
        self.requests.strong_count() == 1
    }

    /// Attach a connection, hydrating the session first if needed.
    ///
    /// Answered immediately, even while a reply is being generated.
    pub async fn attach(&self) -> Result<Attachment> {
        let (tx, rx) = oneshot::channel();
        self.request(RelayRequest::Attach(tx)).await?;
        rx.await.context("relay dropped attach request")?
    }

    /// Queue a client command. Returns once queued, not once handled.
    pub async fn send(&self, command: ClientCommand) -> Result<()> {
        self.request(RelayRequest::Command(command)).await
    }

    /// Current session state, without waiting for queued commands.
    pub async fn inspect(&self) -> Result<SessionInfo> {
        let (tx, rx) = oneshot::channel();
        self.request(RelayRequest::Inspect(tx)).await?;
        rx.await.context("relay dropped inspect request")?
    }

    /// Wait until every command queued before this call has been handled,
    /// including persisting any reply it generated.
    pub async fn settle(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(RelayRequest::Settle(tx)).await?;
        rx.await.context("relay dropped settle request")
    }

    async fn request(&self, request: RelayRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| anyhow!("relay for session {} has stopped", self.session_id))
    }
}

struct Relay {
    manager: SessionStateManager,
    backend: Arc<dyn InferenceBackend>,
    settings: Arc<RelaySettings>,
    events: broadcast::Sender<ServerEvent>,
    phase: watch::Sender<RelayPhase>,
    /// Commands received while a reply is being generated, in arrival order.
    deferred: VecDeque<Deferred>,
    /// The in-flight reply, resolving to its full text.
    generation: Option<JoinHandle<String>>,
    release: ReleaseFn,
}

impl Relay {
    async fn run(mut self, mut requests: mpsc::Receiver<RelayRequest>) {
        debug!(session_id = %self.manager.session_id(), "relay started");

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                result = join_generation(&mut self.generation) => {
                    self.finish_generation(result).await;
                    self.drain_deferred().await;
                }
                _ = tokio::time::sleep(self.settings.idle_timeout) => {
                    if self.is_idle() && (self.release)() {
                        debug!(session_id = %self.manager.session_id(), "relay released, draining");
                    }
                }
            }
        }

        // Every handle is gone; let queued work finish so nothing is lost.
        self.drain_deferred().await;
        while self.generation.is_some() {
            let result = join_generation(&mut self.generation).await;
            self.finish_generation(result).await;
            self.drain_deferred().await;
        }

        debug!(session_id = %self.manager.session_id(), "relay stopped");
    }

    fn is_idle(&self) -> bool {
        self.generation.is_none() && self.deferred.is_empty() && self.events.receiver_count() == 0
    }

    async fn handle(&mut self, request: RelayRequest) {
        match request {
            RelayRequest::Attach(reply) => {
                let result = self.attach().await;
                let _ = reply.send(result);
            }
            RelayRequest::Inspect(reply) => {
                let result = self.ensure_hydrated().await.map(|()| self.manager.info());
                let _ = reply.send(result);
            }
            RelayRequest::Command(command) => {
                self.deferred.push_back(Deferred::Command(command));
                self.drain_deferred().await;
            }
            RelayRequest::Settle(reply) => {
                self.deferred.push_back(Deferred::Settle(reply));
                self.drain_deferred().await;
            }
        }
    }

    /// Run deferred work in order until a command starts a new generation.
    async fn drain_deferred(&mut self) {
        while self.generation.is_none() {
            match self.deferred.pop_front() {
                Some(Deferred::Command(command)) => self.dispatch(command).await,
                Some(Deferred::Settle(reply)) => {
                    let _ = reply.send(());
                }
                None => break,
            }
        }
    }

    async fn attach(&mut self) -> Result<Attachment> {
        self.ensure_hydrated().await?;
        // Subscribing inside the relay task means the connection sees every
        // event after its snapshot and none before.
        Ok(Attachment {
            snapshot: self.manager.snapshot(),
            events: self.events.subscribe(),
        })
    }

    async fn ensure_hydrated(&mut self) -> Result<()> {
        let phase = *self.phase.borrow();
        if phase != RelayPhase::Hydrating {
            return Ok(());
        }

        self.manager.store().ensure_schema().await?;
        self.manager.hydrate().await?;
        self.set_phase(RelayPhase::Idle);
        info!(
            session_id = %self.manager.session_id(),
            messages = self.manager.state().messages.len(),
            "session hydrated"
        );
        Ok(())
    }

    async fn dispatch(&mut self, command: ClientCommand) {
        if let Err(e) = self.ensure_hydrated().await {
            error!(session_id = %self.manager.session_id(), error = ?e, "hydration failed, dropping command");
            if matches!(command, ClientCommand::Chat { .. }) {
                let _ = self.events.send(ServerEvent::Done);
            }
            return;
        }

        match command {
            ClientCommand::Chat { text } => {
                if text.trim().is_empty() {
                    debug!(session_id = %self.manager.session_id(), "ignoring empty chat");
                    return;
                }
                self.start_chat(text).await;
            }
            ClientCommand::Reset => self.reset().await,
            ClientCommand::Model { model } => {
                if !is_valid_model_id(&model) {
                    warn!(session_id = %self.manager.session_id(), model = %model, "ignoring invalid model identifier");
                    return;
                }
                info!(session_id = %self.manager.session_id(), model = %model, "model changed");
                self.manager.set_model(model);
            }
        }
    }

    async fn start_chat(&mut self, text: String) {
        let session_id = self.manager.session_id().to_string();

        if let Err(e) = self.manager.append_message(Role::User, text).await {
            error!(session_id = %session_id, error = ?e, "failed to persist user message");
            let _ = self.events.send(ServerEvent::Done);
            return;
        }

        self.set_phase(RelayPhase::Generating);

        let turns = build_turns(
            &self.settings.system_prompt,
            &self.manager.recent_conversation(self.settings.history_window),
        );
        let model = self.manager.model().to_string();
        info!(session_id = %session_id, model = %model, turns = turns.len(), "generating reply");

        let backend = self.backend.clone();
        let events = self.events.clone();
        let stream_idle_timeout = self.settings.stream_idle_timeout;
        self.generation = Some(tokio::spawn(async move {
            let reply = generate_reply(backend.as_ref(), &model, turns, stream_idle_timeout, |text| {
                let _ = events.send(ServerEvent::Delta {
                    text: text.to_string(),
                });
            })
            .await;

            // `done` means no more deltas; the reply is persisted afterwards.
            let _ = events.send(ServerEvent::Done);
            reply
        }));
    }

    async fn finish_generation(&mut self, result: Result<String, JoinError>) {
        let session_id = self.manager.session_id().to_string();
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "generation task failed");
                let _ = self.events.send(ServerEvent::Delta {
                    text: STREAM_ERROR_PLACEHOLDER.to_string(),
                });
                let _ = self.events.send(ServerEvent::Done);
                STREAM_ERROR_PLACEHOLDER.to_string()
            }
        };

        match self.manager.append_message(Role::Assistant, reply).await {
            Ok(message) => debug!(
                session_id = %session_id,
                len = message.content.len(),
                "assistant reply persisted"
            ),
            Err(e) => error!(session_id = %session_id, error = ?e, "failed to persist assistant reply"),
        }

        self.set_phase(RelayPhase::Idle);
    }

    async fn reset(&mut self) {
        match self.manager.reset().await {
            Ok(deleted) => {
                info!(session_id = %self.manager.session_id(), deleted, "session cleared");
                let _ = self.events.send(ServerEvent::Cleared);
            }
            Err(e) => {
                error!(session_id = %self.manager.session_id(), error = ?e, "failed to clear session");
            }
        }
    }

    fn set_phase(&self, phase: RelayPhase) {
        if self.phase.send_replace(phase) != phase {
            debug!(session_id = %self.manager.session_id(), %phase, "phase changed");
        }
    }
}

/// Resolves when the in-flight generation finishes; pending when there is none.
async fn join_generation(generation: &mut Option<JoinHandle<String>>) -> Result<String, JoinError> {
    let result = match generation.as_mut() {
        Some(handle) => handle.await,
        None => return std::future::pending().await,
    };
    *generation = None;
    result
}
