//! minimal bevy + bevy_rag_chat example against a news-style rag backend.
//! - backend base url from `CHAT_API_URL` (see `ChatConfig`).
//! - streaming on by default (`CHAT_STREAM=0` for whole replies).
//! - enter sends, esc clears the history, f2 asks the backend for a new session.
//!
//! the in-progress reply is shown through the session's `RevealCursor`, so it
//! types out at a steady pace no matter how the network delivers it.

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_rag_chat::{
    ChatCompletedEvt, ChatConfig, ChatErrorEvt, ChatPlugin, ChatSession, ChatSessionEvt, ChatSet,
    RevealCursor, Role, SessionState, clear_messages, request_new_session, send_message,
};

/// input limit, in characters.
const MAX_PROMPT: usize = 5000;
/// sources listed under each reply before collapsing the rest.
const MAX_SOURCES: usize = 2;

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct HeaderText;
#[derive(Component)]
struct ErrorText;
#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct StreamText;
#[derive(Component)]
struct PromptText;

#[derive(Resource, Copy, Clone)]
struct TargetSession(Entity);

#[derive(Resource, Default)]
struct PromptBuf(String);

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(ChatConfig::from_env())
        .insert_resource(PromptBuf::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(ChatPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, refresh_prompt_text).before(ChatSet::Submit))
        // readers run after the plugin has folded this frame's network results
        .add_systems(
            Update,
            (
                refresh_header_text,
                refresh_error_text,
                refresh_history_text,
                refresh_stream_text,
                log_chat_events,
            )
                .after(ChatSet::Reveal),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands, config: Res<ChatConfig>) {
    commands.spawn(Camera2d);

    let session = commands.spawn(ChatSession::from_config(&config)).id();
    commands.insert_resource(TargetSession(session));
    info!(target: "chat_example", "backend: {} (stream={})", config.base_url, config.stream);

    let style_18 = TextFont {
        font_size: 18.0,
        ..default()
    };
    let style_14 = TextFont {
        font_size: 14.0,
        ..default()
    };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            // --- header ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(4.0),
                    padding: UiRect::all(Val::Px(8.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
            ))
            .with_children(|c| {
                c.spawn((
                    Text::new("news chat assistant"),
                    style_14.clone(),
                    TextColor(Color::WHITE),
                    HeaderText,
                ));
                c.spawn((
                    Text::new(""),
                    style_14.clone(),
                    TextColor(Color::srgb(0.95, 0.45, 0.45)),
                    ErrorText,
                ));
            });

            // --- conversation ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Percent(100.0),
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(8.0),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    overflow: Overflow::clip(),
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|c| {
                c.spawn((
                    Text::new(""),
                    style_18.clone(),
                    TextColor(Color::WHITE),
                    HistoryText,
                ));
                c.spawn((
                    Text::new(""),
                    style_18.clone(),
                    TextColor(Color::srgb_u8(200, 200, 200)),
                    StreamText,
                ));
            });

            p.spawn((
                Text::new("> "),
                style_14.clone(),
                TextColor(Color::WHITE),
                PromptText,
            ));
        });

    request_new_session(&mut commands, session);
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    target: Res<TargetSession>,
    q_state: Query<&SessionState>,
) {
    for ev in ev_kbd.read() {
        if !ev.state.is_pressed() {
            continue;
        }
        if let Some(txt) = &ev.text {
            let s = txt.replace(['\r', '\n', '\u{1b}'], "");
            let room = MAX_PROMPT.saturating_sub(prompt.0.chars().count());
            prompt.0.extend(s.chars().filter(|c| !c.is_control()).take(room));
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    if keys.just_pressed(KeyCode::Escape) {
        clear_messages(&mut commands, target.0);
    }

    if keys.just_pressed(KeyCode::F2) {
        request_new_session(&mut commands, target.0);
    }

    if keys.just_pressed(KeyCode::Enter) {
        let busy = q_state.get(target.0).map(|s| s.is_loading).unwrap_or(true);
        // keep the draft while a reply is pending; the session would reject it anyway
        if !busy && !prompt.0.trim().is_empty() {
            let msg = std::mem::take(&mut prompt.0);
            send_message(&mut commands, target.0, msg.trim());
        }
    }
}

// ---------------------- text refresh ----------------------

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed() {
        if let Ok(mut t) = q.single_mut() {
            t.0 = format!("> {} |   ({}/{})", prompt.0, prompt.0.chars().count(), MAX_PROMPT);
        }
    }
}

fn refresh_header_text(
    q_session: Query<&ChatSession, Changed<ChatSession>>,
    mut q: Query<&mut Text, With<HeaderText>>,
) {
    for session in q_session.iter() {
        if let Ok(mut t) = q.single_mut() {
            let id = session
                .session_id
                .as_deref()
                .map(|id| format!("{}...", id.chars().take(8).collect::<String>()))
                .unwrap_or_else(|| "<none>".to_string());
            t.0 = format!("news chat assistant   session: {id}   [esc] clear  [f2] new session");
        }
    }
}

fn refresh_error_text(
    q_state: Query<&SessionState, Changed<SessionState>>,
    mut q: Query<&mut Text, With<ErrorText>>,
) {
    for state in q_state.iter() {
        if let Ok(mut t) = q.single_mut() {
            t.0 = state
                .error
                .as_ref()
                .map(|e| format!("error: {e}"))
                .unwrap_or_default();
        }
    }
}

/// whether the reveal is still typing out the last, already finished reply.
fn still_revealing(state: &SessionState, reveal: &RevealCursor) -> bool {
    reveal
        .revealed(state)
        .is_some_and(|shown| shown.complete && !shown.caught_up)
}

fn refresh_history_text(
    q_state: Query<(&SessionState, &RevealCursor)>,
    mut q: Query<&mut Text, With<HistoryText>>,
) {
    for (state, reveal) in q_state.iter() {
        let Ok(mut t) = q.single_mut() else {
            continue;
        };
        if state.messages.is_empty() {
            let hint = "ask me about recent news, e.g. \"what's happening in technology?\"";
            if t.0 != hint {
                t.0 = hint.to_string();
            }
            continue;
        }
        // the stream line owns the last reply until it is fully revealed
        let shown = if still_revealing(state, reveal) {
            &state.messages[..state.messages.len() - 1]
        } else {
            &state.messages[..]
        };
        let mut out = String::new();
        for m in shown {
            let who = match m.role {
                Role::User => "you",
                Role::Assistant => "assistant",
            };
            out.push_str(&format!("{who}: {}\n", m.content));
            for s in m.sources.iter().take(MAX_SOURCES) {
                let score = s.score.map(|v| format!(" {:.0}%", v * 100.0)).unwrap_or_default();
                let url = s.url.as_deref().map(|u| format!(" <{u}>")).unwrap_or_default();
                out.push_str(&format!("    - {}{score}{url}\n", s.title));
            }
            if m.sources.len() > MAX_SOURCES {
                out.push_str(&format!("    +{} more sources\n", m.sources.len() - MAX_SOURCES));
            }
        }
        if t.0 != out {
            t.0 = out;
        }
    }
}

/// the reply as revealed so far, with a caret while it is still streaming.
fn refresh_stream_text(
    q_state: Query<(&SessionState, &RevealCursor)>,
    mut q: Query<&mut Text, With<StreamText>>,
) {
    let Ok(mut t) = q.single_mut() else {
        return;
    };
    let mut line = String::new();
    for (state, reveal) in q_state.iter() {
        if state.streaming.is_none() && !still_revealing(state, reveal) {
            if state.is_loading {
                line = "assistant is thinking...".to_string();
            }
            continue;
        }
        if let Some(shown) = reveal.revealed(state) {
            let caret = if shown.caret { "|" } else { "" };
            line = format!("assistant: {}{caret}", shown.text);
        }
    }
    if t.0 != line {
        t.0 = line;
    }
}

fn log_chat_events(
    mut ev_done: EventReader<ChatCompletedEvt>,
    mut ev_err: EventReader<ChatErrorEvt>,
    mut ev_session: EventReader<ChatSessionEvt>,
) {
    for ChatCompletedEvt { message, .. } in ev_done.read() {
        info!(target: "chat_example", "reply complete: {} chars, {} sources", message.content.len(), message.sources.len());
    }
    for ChatErrorEvt { error, .. } in ev_err.read() {
        warn!(target: "chat_example", "chat failed ({:?}): {}", error.kind(), error);
    }
    for ChatSessionEvt { session_id, .. } in ev_session.read() {
        info!(target: "chat_example", "session: {}", session_id);
    }
}
