//! conversation state and its pure transition function.
//!
//! nothing outside `reduce` writes a `SessionState`; the plugin systems fold
//! actions through it and views only read.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::{ChatReply, DispatchError};
use crate::reveal::KnownText;

/// who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// identity of a message within one session. assigned on append.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

/// a cited document fragment returned alongside an assistant reply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Source {
    pub title: String,
    pub url: Option<String>,
    pub snippet: Option<String>,
    /// relevance in `[0, 1]` when the backend reports one.
    pub score: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub sources: Vec<Source>,
    /// app clock when the message was appended.
    pub timestamp: Duration,
}

impl Message {
    pub fn user(content: impl Into<String>, timestamp: Duration) -> Self {
        Self {
            id: MessageId::default(),
            role: Role::User,
            content: content.into(),
            sources: Vec::new(),
            timestamp,
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<Source>, timestamp: Duration) -> Self {
        Self {
            id: MessageId::default(),
            role: Role::Assistant,
            content: content.into(),
            sources,
            timestamp,
        }
    }
}

/// the assistant message currently being streamed in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamingDraft {
    pub id: MessageId,
    pub content: String,
    pub sources: Vec<Source>,
}

/// per-session conversation state.
///
/// replaced wholesale (see [`SessionState::for_session`]) when the session id
/// changes; never merged.
#[derive(bevy::prelude::Component, Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    /// backend session id this history belongs to.
    pub session: Option<String>,
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub streaming: Option<StreamingDraft>,
    /// bumped on every clear; turn results tagged with an older epoch are stale.
    pub epoch: u64,
    next_id: u64,
}

/// the transitions a `SessionState` accepts.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    SetLoading(bool),
    SetError(Option<String>),
    /// append a message; its `id` is overwritten with the next session id.
    AddMessage(Message),
    ClearMessages,
    /// open a fresh assistant draft.
    BeginStream,
    /// fold one decoded stream event into the draft. `sources` replaces the
    /// draft's sources when present.
    AppendDelta {
        content: Option<String>,
        sources: Option<Vec<Source>>,
    },
    /// commit the draft as an assistant message, keeping its id.
    FinishStream { timestamp: Duration },
    /// drop the draft without appending anything.
    AbortStream,
}

/// why a send was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendRejected {
    #[error("message is empty")]
    Empty,
    #[error("a request is already in flight")]
    Busy,
}

impl SessionState {
    pub fn for_session(session: Option<String>) -> Self {
        Self {
            session,
            ..Default::default()
        }
    }

    /// whether `text` would be accepted as a new turn right now.
    pub fn check_send(&self, text: &str) -> Result<(), SendRejected> {
        if text.trim().is_empty() {
            return Err(SendRejected::Empty);
        }
        if self.is_loading {
            return Err(SendRejected::Busy);
        }
        Ok(())
    }

    /// latest known text of the assistant message being revealed.
    ///
    /// the open draft while streaming; otherwise the last message if it came
    /// from the assistant, marked complete.
    pub fn known_text(&self) -> Option<KnownText<'_>> {
        if let Some(draft) = &self.streaming {
            return Some(KnownText {
                id: draft.id,
                text: &draft.content,
                complete: false,
            });
        }
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| KnownText {
                id: m.id,
                text: &m.content,
                complete: true,
            })
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// pure transition function.
pub fn reduce(mut state: SessionState, action: Action) -> SessionState {
    match action {
        Action::SetLoading(loading) => state.is_loading = loading,
        Action::SetError(error) => state.error = error,
        Action::AddMessage(mut message) => {
            message.id = state.allocate_id();
            state.messages.push(message);
        }
        Action::ClearMessages => {
            state.messages.clear();
            state.streaming = None;
            state.error = None;
            state.epoch += 1;
        }
        Action::BeginStream => {
            let id = state.allocate_id();
            state.streaming = Some(StreamingDraft {
                id,
                ..Default::default()
            });
        }
        Action::AppendDelta { content, sources } => {
            if let Some(draft) = state.streaming.as_mut() {
                if let Some(delta) = content {
                    draft.content.push_str(&delta);
                }
                if let Some(sources) = sources {
                    draft.sources = sources;
                }
            }
        }
        Action::FinishStream { timestamp } => {
            if let Some(draft) = state.streaming.take() {
                state.messages.push(Message {
                    id: draft.id,
                    role: Role::Assistant,
                    content: draft.content,
                    sources: draft.sources,
                    timestamp,
                });
            }
        }
        Action::AbortStream => state.streaming = None,
    }
    state
}

pub fn reduce_all(state: SessionState, actions: impl IntoIterator<Item = Action>) -> SessionState {
    actions.into_iter().fold(state, reduce)
}

/// accept `text` as a new turn: clear the previous error, append the user
/// message and mark loading.
pub fn begin_turn(
    state: SessionState,
    text: &str,
    timestamp: Duration,
) -> Result<SessionState, SendRejected> {
    state.check_send(text)?;
    Ok(reduce_all(
        state,
        [
            Action::SetError(None),
            Action::AddMessage(Message::user(text, timestamp)),
            Action::SetLoading(true),
        ],
    ))
}

/// settle a whole-response turn.
pub fn settle_turn(
    state: SessionState,
    outcome: Result<ChatReply, DispatchError>,
    timestamp: Duration,
) -> SessionState {
    let actions = match outcome {
        Ok(reply) => vec![
            Action::AddMessage(Message::assistant(reply.response, reply.sources, timestamp)),
            Action::SetLoading(false),
        ],
        Err(err) => vec![
            Action::AbortStream,
            Action::SetError(Some(err.to_string())),
            Action::SetLoading(false),
        ],
    };
    reduce_all(state, actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const T0: Duration = Duration::ZERO;

    fn reply(text: &str) -> ChatReply {
        ChatReply {
            response: text.to_string(),
            sources: Vec::new(),
        }
    }

    #[test]
    fn blank_input_leaves_state_untouched() {
        let state = SessionState::default();
        for text in ["", "   ", "\n\t "] {
            assert_eq!(begin_turn(state.clone(), text, T0), Err(SendRejected::Empty));
        }
    }

    #[test]
    fn busy_session_rejects_second_send() {
        let state = begin_turn(SessionState::default(), "first", T0).unwrap();
        assert!(state.is_loading);
        assert_eq!(begin_turn(state.clone(), "second", T0), Err(SendRejected::Busy));
        assert_eq!(state.messages.len(), 1);
    }

    #[test]
    fn hello_round_trip() {
        let state = begin_turn(SessionState::default(), "hello", T0).unwrap();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.messages[0].content, "hello");

        let state = settle_turn(state, Ok(reply("hi there")), T0);
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].role, Role::Assistant);
        assert_eq!(state.messages[1].content, "hi there");
        assert!(!state.is_loading);
        assert_eq!(state.error, None);
    }

    #[test]
    fn n_round_trips_alternate_roles() {
        let mut state = SessionState::default();
        for n in 0..5 {
            state = begin_turn(state, &format!("q{n}"), T0).unwrap();
            state = settle_turn(state, Ok(reply(&format!("a{n}"))), T0);
        }
        assert_eq!(state.messages.len(), 10);
        for (i, m) in state.messages.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            assert_eq!(m.role, expected);
        }
        let ids: Vec<u64> = state.messages.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn failure_keeps_user_message_and_sets_error() {
        let state = begin_turn(SessionState::default(), "hello", T0).unwrap();
        let err = DispatchError::http(500, "Internal Server Error", br#"{"error":"overloaded"}"#);
        let state = settle_turn(state, Err(err), T0);
        assert_eq!(state.error.as_deref(), Some("overloaded"));
        assert!(!state.is_loading);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, Role::User);
    }

    #[test]
    fn next_send_clears_previous_error() {
        let state = SessionState {
            error: Some("boom".into()),
            ..Default::default()
        };
        let state = begin_turn(state, "again", T0).unwrap();
        assert_eq!(state.error, None);
    }

    #[test]
    fn clear_is_unconditional() {
        let state = begin_turn(SessionState::default(), "hello", T0).unwrap();
        let state = reduce(state, Action::BeginStream);
        let state = reduce(
            state,
            Action::AppendDelta {
                content: Some("partial".into()),
                sources: None,
            },
        );
        let cleared = reduce(state, Action::ClearMessages);
        assert!(cleared.messages.is_empty());
        assert!(cleared.streaming.is_none());
        assert!(cleared.is_loading, "the outstanding request still owns the session");
        assert_eq!(cleared.epoch, 1);
    }

    #[test]
    fn streamed_draft_commits_under_its_own_id() {
        let state = begin_turn(SessionState::default(), "hello", T0).unwrap();
        let state = reduce(state, Action::BeginStream);
        let draft_id = state.streaming.as_ref().unwrap().id;
        let state = reduce_all(
            state,
            [
                Action::AppendDelta {
                    content: Some("A".into()),
                    sources: None,
                },
                Action::AppendDelta {
                    content: Some("B".into()),
                    sources: Some(vec![Source {
                        title: "doc".into(),
                        ..Default::default()
                    }]),
                },
            ],
        );
        let known = state.known_text().unwrap();
        assert_eq!((known.id, known.text, known.complete), (draft_id, "AB", false));

        let state = reduce(state, Action::FinishStream { timestamp: T0 });
        let last = state.messages.last().unwrap();
        assert_eq!(last.id, draft_id);
        assert_eq!(last.content, "AB");
        assert_eq!(last.sources.len(), 1);
        assert!(state.known_text().unwrap().complete);
    }

    #[test]
    fn delta_without_draft_is_ignored() {
        let state = SessionState::default();
        let next = reduce(
            state.clone(),
            Action::AppendDelta {
                content: Some("x".into()),
                sources: None,
            },
        );
        assert_eq!(next, state);
    }
}
