//! bevy_rag_chat: a bevy client for a retrieval-augmented chat backend.
//!
//! - one entity per conversation: `ChatSession` pulls in its `SessionState`
//!   (history, loading, error) and a `RevealCursor` (typewriter pacing).
//! - `SessionState` only changes through [`session::reduce`], and only in the
//!   systems below; views read it.
//! - requests never block the main thread: they run on bevy's async compute
//!   pool and report back through a bounded inbox drained once per frame.
//! - streamed replies are decoded from `data: <json>` lines and folded into an
//!   assistant draft in wire order; the reveal system paces what is shown on
//!   its own fixed tick.
//!
//! backend routes (relative to `ChatConfig::base_url`):
//!   - `POST /chat/message`         whole reply with sources
//!   - `POST /chat/message/stream`  line-delimited `data: {content?, sources?, done?}`
//!   - `POST /sessions`             opaque session id

use bevy::prelude::*;
use bevy::tasks::{AsyncComputeTaskPool, Task};
use flume::{Receiver, Sender};
use std::sync::Arc;

pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod reveal;
pub mod session;

pub use config::{ChatConfig, RevealConfig};
pub use decoder::{ChatEventStream, DecodeWarning, StreamEvent, StreamEventDecoder};
#[cfg(target_arch = "wasm32")]
pub use dispatch::FetchTransport;
#[cfg(not(target_arch = "wasm32"))]
pub use dispatch::ReqwestTransport;
pub use dispatch::{ChatReply, ChatTransport, DispatchError, ErrorKind, SessionInfo};
pub use reveal::{KnownText, RenderScheduler, RevealFrame};
pub use session::{
    Action, Message, MessageId, Role, SendRejected, SessionState, Source, StreamingDraft, reduce,
};

use session::{begin_turn, reduce_all, settle_turn};

/// the transport every session talks through.
///
/// inserted from `ChatConfig` at startup unless the app provides one first,
/// e.g. a fake in tests.
#[derive(Resource, Clone)]
pub struct ChatBackend(pub Arc<dyn ChatTransport>);

impl ChatBackend {
    pub fn new(transport: impl ChatTransport + 'static) -> Self {
        Self(Arc::new(transport))
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self, DispatchError> {
        #[cfg(not(target_arch = "wasm32"))]
        let transport = ReqwestTransport::new(config.base_url.clone())?;
        #[cfg(target_arch = "wasm32")]
        let transport = FetchTransport::new(config.base_url.clone());
        Ok(Self::new(transport))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// session resets, clears and new turns
    Submit,
    /// inbox drained, `SessionState` updated, Chat* events emitted
    Drain,
    /// reveal cursors ticked
    Reveal,
}

/// attach this to an entity to hold one conversation.
#[derive(Component, Clone, Debug, Default)]
#[require(SessionState, RevealCursor)]
pub struct ChatSession {
    /// backend-issued id. changing it replaces the whole `SessionState`.
    pub session_id: Option<String>,
    /// use the streaming endpoint (`true`) or the whole-response one.
    pub stream: bool,
}

impl ChatSession {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            session_id: None,
            stream: config.stream,
        }
    }
}

/// typewriter pacing for a session's in-progress assistant message.
#[derive(Component, Clone, Debug)]
pub struct RevealCursor {
    scheduler: RenderScheduler,
    timer: Timer,
    frame: RevealFrame,
}

impl Default for RevealCursor {
    fn default() -> Self {
        Self::new(RevealConfig::default())
    }
}

/// the revealed part of the message a session is showing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Revealed<'a> {
    pub id: MessageId,
    pub text: &'a str,
    pub caret: bool,
    pub complete: bool,
    /// every known character is on screen.
    pub caught_up: bool,
}

impl RevealCursor {
    pub fn new(config: RevealConfig) -> Self {
        Self {
            scheduler: RenderScheduler::new(config.step),
            timer: Timer::new(config.period, TimerMode::Repeating),
            frame: RevealFrame::default(),
        }
    }

    pub fn frame(&self) -> RevealFrame {
        self.frame
    }

    /// slice of `state`'s known text that is currently on screen.
    pub fn revealed<'a>(&self, state: &'a SessionState) -> Option<Revealed<'a>> {
        let known = state.known_text()?;
        let text = if self.scheduler.message() == Some(known.id) {
            self.scheduler.visible(known.text)
        } else {
            ""
        };
        Some(Revealed {
            id: known.id,
            text,
            caret: self.scheduler.frame(known).caret,
            complete: known.complete,
            caught_up: text.len() == known.text.len(),
        })
    }

    fn configure(&mut self, config: RevealConfig) {
        if self.timer.duration() != config.period {
            self.timer.set_duration(config.period);
        }
        self.scheduler.set_step(config.step);
    }

    fn reset(&mut self) {
        self.scheduler.reset();
        self.timer.reset();
        self.frame = RevealFrame::default();
    }
}

/// insert to start a new turn on a session entity. removed once handled.
#[derive(Component, Clone, Debug)]
pub struct ChatRequest {
    pub text: String,
}

/// insert to clear a session's history, whatever it is doing.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct ClearRequest;

/// insert to ask the backend for a fresh session id.
#[derive(Component, Clone, Copy, Debug, Default)]
pub struct NewSessionRequest;

/// helper to enqueue a user message on a session entity.
///
/// a second call in the same frame is dropped; the session decides later
/// whether the first is accepted (non-blank, nothing in flight).
pub fn send_message(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_rag_chat", "send_message -> '{}' (len={})", text, text.len());
    commands.entity(target).insert_if_new(ChatRequest { text });
}

pub fn clear_messages(commands: &mut Commands, target: Entity) {
    info!(target: "bevy_rag_chat", "clear_messages -> {:?}", target);
    commands.entity(target).insert(ClearRequest);
}

pub fn request_new_session(commands: &mut Commands, target: Entity) {
    info!(target: "bevy_rag_chat", "request_new_session -> {:?}", target);
    commands.entity(target).insert(NewSessionRequest);
}

/// events emitted while a turn progresses.
#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
}
#[derive(Event, Debug)]
pub struct ChatDeltaEvt {
    pub entity: Entity,
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    /// the assistant message just appended.
    pub message: Message,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: DispatchError,
}
#[derive(Event, Debug)]
pub struct ChatSessionEvt {
    pub entity: Entity,
    pub session_id: String,
}

/// the task driving a session's current turn. dropping it cancels the turn
/// and releases the response body.
#[derive(Component)]
struct InFlight {
    turn: u64,
    /// `SessionState::epoch` when the turn started.
    epoch: u64,
    _task: Task<()>,
}

/// cross-thread inbox; request tasks send, the main schedule drains.
/// bounded, and tasks wait for room rather than dropping deltas.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
enum StreamMsg {
    Begin { entity: Entity, turn: u64 },
    Delta { entity: Entity, turn: u64, event: StreamEvent },
    Reply { entity: Entity, turn: u64, reply: ChatReply },
    Done { entity: Entity, turn: u64 },
    Err { entity: Entity, turn: u64, error: DispatchError },
    Session { entity: Entity, result: Result<SessionInfo, DispatchError> },
}

impl StreamMsg {
    fn entity(&self) -> Entity {
        match self {
            Self::Begin { entity, .. }
            | Self::Delta { entity, .. }
            | Self::Reply { entity, .. }
            | Self::Done { entity, .. }
            | Self::Err { entity, .. }
            | Self::Session { entity, .. } => *entity,
        }
    }
}

async fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    // receiver lives as long as the app; nothing to do if it is gone
    let _ = tx.send_async(msg).await;
}

/// bevy plugin: wires systems, events, resources.
/// reads `ChatConfig` from the environment unless the app inserted one, and
/// builds the default `ChatBackend` from it at startup.
pub struct ChatPlugin;

impl Plugin for ChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_rag_chat", "ChatPlugin: build()");
        if app.world().get_resource::<ChatConfig>().is_none() {
            app.insert_resource(ChatConfig::from_env());
        }
        app.init_resource::<StreamInbox>()
            .add_event::<ChatStarted>()
            .add_event::<ChatDeltaEvt>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            .add_event::<ChatSessionEvt>()
            .configure_sets(
                Update,
                (ChatSet::Submit, ChatSet::Drain, ChatSet::Reveal).chain(),
            )
            .add_systems(Startup, init_backend)
            .add_systems(
                Update,
                (
                    reset_on_session_change,
                    apply_clear_requests,
                    spawn_session_requests,
                    spawn_chat_requests,
                )
                    .chain()
                    .in_set(ChatSet::Submit),
            )
            .add_systems(Update, drain_stream_inbox.in_set(ChatSet::Drain))
            .add_systems(Update, tick_reveal.in_set(ChatSet::Reveal));
    }
}

fn init_backend(mut commands: Commands, config: Res<ChatConfig>, backend: Option<Res<ChatBackend>>) {
    if backend.is_some() {
        return;
    }
    info!(target: "bevy_rag_chat", "init_backend: base_url={}", config.base_url);
    match ChatBackend::from_config(&config) {
        Ok(backend) => commands.insert_resource(backend),
        // turns fail with an error on the session until a backend is inserted
        Err(err) => error!(target: "bevy_rag_chat", "init_backend failed: {}", err),
    }
}

/// replace a session's state wholesale when its id changes.
fn reset_on_session_change(
    mut commands: Commands,
    mut q: Query<(Entity, &ChatSession, &mut SessionState, &mut RevealCursor), Changed<ChatSession>>,
) {
    for (e, session, mut state, mut reveal) in q.iter_mut() {
        if state.session == session.session_id {
            continue;
        }
        info!(target: "bevy_rag_chat",
            "session {:?} -> {:?} on {:?}: replacing state",
            state.session, session.session_id, e
        );
        *state = SessionState::for_session(session.session_id.clone());
        reveal.reset();
        commands.entity(e).remove::<InFlight>();
    }
}

fn apply_clear_requests(
    mut commands: Commands,
    mut q: Query<(Entity, &mut SessionState), With<ClearRequest>>,
) {
    for (e, mut state) in q.iter_mut() {
        commands.entity(e).remove::<ClearRequest>();
        debug!(target: "bevy_rag_chat", "clearing {} messages on {:?} (loading={})",
            state.messages.len(), e, state.is_loading);
        *state = reduce(std::mem::take(&mut *state), Action::ClearMessages);
    }
}

fn spawn_session_requests(
    mut commands: Commands,
    backend: Option<Res<ChatBackend>>,
    inbox: Res<StreamInbox>,
    q: Query<Entity, With<NewSessionRequest>>,
) {
    for e in q.iter() {
        commands.entity(e).remove::<NewSessionRequest>();
        let Some(backend) = backend.as_ref() else {
            warn!(target: "bevy_rag_chat", "no ChatBackend; cannot request a session");
            continue;
        };
        let transport = backend.0.clone();
        let tx = inbox.tx.clone();
        AsyncComputeTaskPool::get()
            .spawn(async move {
                let result = transport.create_session().await;
                push_inbox(&tx, StreamMsg::Session { entity: e, result }).await;
            })
            .detach();
    }
}

/// accepts or rejects pending requests and spawns a task per accepted turn.
fn spawn_chat_requests(
    mut commands: Commands,
    backend: Option<Res<ChatBackend>>,
    inbox: Res<StreamInbox>,
    time: Res<Time>,
    mut next_turn: Local<u64>,
    mut q: Query<(Entity, &ChatSession, &mut SessionState, &ChatRequest)>,
    mut ev_start: EventWriter<ChatStarted>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    for (e, session, mut state, req) in q.iter_mut() {
        commands.entity(e).remove::<ChatRequest>();

        // the user message lands here, before any network call is issued
        let started = match begin_turn(state.clone(), &req.text, time.elapsed()) {
            Ok(next) => next,
            Err(reason) => {
                debug!(target: "bevy_rag_chat", "send rejected on {:?}: {}", e, reason);
                continue;
            }
        };

        let Some(backend) = backend.as_ref() else {
            let error = DispatchError::connection("no chat backend configured");
            error!(target: "bevy_rag_chat", "{}", error);
            *state = settle_turn(started, Err(error.clone()), time.elapsed());
            ev_err.write(ChatErrorEvt { entity: e, error });
            continue;
        };
        *state = started;

        *next_turn += 1;
        let turn = *next_turn;
        let transport = backend.0.clone();
        let tx = inbox.tx.clone();
        let text = req.text.clone();
        let stream = session.stream;
        info!(target: "bevy_rag_chat",
            "spawn_chat_requests: entity={:?} turn={} stream={} history={}",
            e, turn, stream, state.messages.len()
        );

        let task = AsyncComputeTaskPool::get().spawn(run_turn(transport, tx, e, turn, text, stream));
        commands.entity(e).insert(InFlight {
            turn,
            epoch: state.epoch,
            _task: task,
        });
        ev_start.write(ChatStarted { entity: e });
    }
}

/// one request/response cycle. everything it learns goes through the inbox.
async fn run_turn(
    transport: Arc<dyn ChatTransport>,
    tx: Sender<StreamMsg>,
    entity: Entity,
    turn: u64,
    text: String,
    stream: bool,
) {
    if !stream {
        let msg = match transport.send_message(&text).await {
            Ok(reply) => {
                info!(target: "bevy_rag_chat", "chat completed: final_len={}", reply.response.len());
                StreamMsg::Reply { entity, turn, reply }
            }
            Err(error) => {
                error!(target: "bevy_rag_chat", "chat error: {}", error);
                StreamMsg::Err { entity, turn, error }
            }
        };
        push_inbox(&tx, msg).await;
        return;
    }

    let chunks = match transport.send_message_stream(&text).await {
        Ok(chunks) => chunks,
        Err(error) => {
            error!(target: "bevy_rag_chat", "stream open error: {}", error);
            push_inbox(&tx, StreamMsg::Err { entity, turn, error }).await;
            return;
        }
    };
    push_inbox(&tx, StreamMsg::Begin { entity, turn }).await;

    let mut events = ChatEventStream::new(chunks);
    let mut final_len = 0;
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => {
                final_len += event.content.as_ref().map_or(0, String::len);
                push_inbox(&tx, StreamMsg::Delta { entity, turn, event }).await;
            }
            Err(error) => {
                error!(target: "bevy_rag_chat", "streaming error: {}", error);
                push_inbox(&tx, StreamMsg::Err { entity, turn, error }).await;
                return;
            }
        }
    }
    info!(target: "bevy_rag_chat", "stream completed: final_len={}", final_len);
    push_inbox(&tx, StreamMsg::Done { entity, turn }).await;
}

/// drains the inbox and folds it into session state, in arrival order.
///
/// messages from a turn that is no longer the session's in-flight turn
/// (cancelled, or the session was replaced) are dropped. a turn that outlived
/// a clear still ends the loading state, but its content is discarded.
fn drain_stream_inbox(
    mut commands: Commands,
    inbox: Res<StreamInbox>,
    time: Res<Time>,
    mut q: Query<(&mut SessionState, &mut ChatSession, Option<&InFlight>)>,
    mut ev_delta: EventWriter<ChatDeltaEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
    mut ev_session: EventWriter<ChatSessionEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    for msg in inbox.rx.try_iter().take(MAX_PER_FRAME) {
        let entity = msg.entity();
        let Ok((mut state, mut session, in_flight)) = q.get_mut(entity) else {
            debug!(target: "bevy_rag_chat", "dropping inbox message for missing session {:?}", entity);
            continue;
        };

        if let StreamMsg::Session { result, .. } = msg {
            match result {
                Ok(info) => {
                    info!(target: "bevy_rag_chat", "new session issued: {}", info.id);
                    session.session_id = Some(info.id.clone());
                    ev_session.write(ChatSessionEvt { entity, session_id: info.id });
                }
                Err(error) => {
                    error!(target: "bevy_rag_chat", "session request failed: {}", error);
                    *state = reduce(std::mem::take(&mut *state), Action::SetError(Some(error.to_string())));
                    ev_err.write(ChatErrorEvt { entity, error });
                }
            }
            continue;
        }

        let Some(flight) = in_flight else {
            continue;
        };
        let turn = match &msg {
            StreamMsg::Begin { turn, .. }
            | StreamMsg::Delta { turn, .. }
            | StreamMsg::Reply { turn, .. }
            | StreamMsg::Done { turn, .. }
            | StreamMsg::Err { turn, .. } => *turn,
            StreamMsg::Session { .. } => continue,
        };
        if turn != flight.turn {
            debug!(target: "bevy_rag_chat", "dropping message from stale turn {}", turn);
            continue;
        }
        let current = flight.epoch == state.epoch;
        let now = time.elapsed();
        let prev = std::mem::take(&mut *state);

        *state = match msg {
            StreamMsg::Begin { .. } if current => reduce(prev, Action::BeginStream),
            StreamMsg::Delta { event, .. } if current => {
                if let Some(text) = event.content.as_ref().filter(|t| !t.is_empty()) {
                    ev_delta.write(ChatDeltaEvt { entity, text: text.clone() });
                }
                reduce(
                    prev,
                    Action::AppendDelta {
                        content: event.content,
                        sources: event.sources,
                    },
                )
            }
            StreamMsg::Begin { .. } | StreamMsg::Delta { .. } => prev,
            StreamMsg::Reply { reply, .. } => {
                commands.entity(entity).remove::<InFlight>();
                if current {
                    let next = settle_turn(prev, Ok(reply), now);
                    emit_completed(&next, entity, &mut ev_done);
                    next
                } else {
                    reduce(prev, Action::SetLoading(false))
                }
            }
            StreamMsg::Done { .. } => {
                commands.entity(entity).remove::<InFlight>();
                if current {
                    let next = reduce_all(
                        prev,
                        [Action::FinishStream { timestamp: now }, Action::SetLoading(false)],
                    );
                    emit_completed(&next, entity, &mut ev_done);
                    next
                } else {
                    reduce(prev, Action::SetLoading(false))
                }
            }
            StreamMsg::Err { error, .. } => {
                commands.entity(entity).remove::<InFlight>();
                if current {
                    ev_err.write(ChatErrorEvt { entity, error: error.clone() });
                    settle_turn(prev, Err(error), now)
                } else {
                    reduce(prev, Action::SetLoading(false))
                }
            }
            StreamMsg::Session { .. } => prev,
        };
    }
}

fn emit_completed(state: &SessionState, entity: Entity, ev_done: &mut EventWriter<ChatCompletedEvt>) {
    if let Some(message) = state.messages.last().filter(|m| m.role == Role::Assistant) {
        ev_done.write(ChatCompletedEvt {
            entity,
            message: message.clone(),
        });
    }
}

/// advances every session's reveal cursor on its own fixed period.
/// reads session state, never writes it.
fn tick_reveal(
    time: Res<Time>,
    config: Res<ChatConfig>,
    mut q: Query<(&SessionState, &mut RevealCursor)>,
) {
    for (state, mut reveal) in q.iter_mut() {
        let reveal = &mut *reveal;
        reveal.configure(config.reveal);
        reveal.timer.tick(time.delta());
        for _ in 0..reveal.timer.times_finished_this_tick() {
            reveal.frame = reveal.scheduler.tick(state.known_text());
        }
        reveal.frame = match state.known_text() {
            Some(known) => reveal.scheduler.frame(known),
            None => RevealFrame {
                shown: reveal.scheduler.cursor(),
                caret: false,
            },
        };
    }
}
