//! typewriter pacing for the in-progress assistant message.
//!
//! the scheduler only ever reads a snapshot of the known text; it owns its
//! cursor and never shares it with the code that grows the text.

use crate::session::MessageId;

/// snapshot of the text being revealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KnownText<'a> {
    pub id: MessageId,
    pub text: &'a str,
    /// no more text will arrive for this message.
    pub complete: bool,
}

/// what the view should show after a tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RevealFrame {
    /// characters of the known text currently shown.
    pub shown: usize,
    /// show an in-progress caret after the shown text.
    pub caret: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderScheduler {
    message: Option<MessageId>,
    cursor: usize,
    step: usize,
}

impl Default for RenderScheduler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl RenderScheduler {
    /// `step` is the most characters revealed per tick (at least one).
    pub fn new(step: usize) -> Self {
        Self {
            message: None,
            cursor: 0,
            step: step.max(1),
        }
    }

    pub fn set_step(&mut self, step: usize) {
        self.step = step.max(1);
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// forget the current message; the next snapshot starts from zero.
    pub fn reset(&mut self) {
        self.message = None;
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn message(&self) -> Option<MessageId> {
        self.message
    }

    /// advance one period against the latest snapshot.
    ///
    /// the pace is the same before and after the message completes; completion
    /// only hides the caret.
    pub fn tick(&mut self, known: Option<KnownText<'_>>) -> RevealFrame {
        let Some(known) = known else {
            return RevealFrame {
                shown: self.cursor,
                caret: false,
            };
        };
        if self.message != Some(known.id) {
            self.message = Some(known.id);
            self.cursor = 0;
        }
        let len = known.text.chars().count();
        if self.cursor < len {
            self.cursor = (self.cursor + self.step).min(len);
        }
        self.frame(known)
    }

    /// current frame for `known` without advancing.
    pub fn frame(&self, known: KnownText<'_>) -> RevealFrame {
        if self.message != Some(known.id) {
            return RevealFrame::default();
        }
        let len = known.text.chars().count();
        RevealFrame {
            shown: self.cursor.min(len),
            caret: !known.complete && self.cursor < len,
        }
    }

    /// the revealed prefix of `text`, cut on a char boundary.
    pub fn visible<'a>(&self, text: &'a str) -> &'a str {
        match text.char_indices().nth(self.cursor) {
            Some((at, _)) => &text[..at],
            None => text,
        }
    }
}
