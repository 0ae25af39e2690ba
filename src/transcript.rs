//! Conversation log and the reducer that folds peer events into it

use crate::protocol::{Message, Role, ServerEvent};
use serde::{Deserialize, Serialize};

/// Prefix that marks a peer-reported failure inside the transcript
pub const ERROR_PREFIX: &str = "Error: ";

/// Ordered conversation log; insertion order is conversation order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Return a transcript with `message` appended
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }
}

impl From<Vec<Message>> for Transcript {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

/// Fold one peer event into the transcript.
///
/// A token extends the trailing assistant message or starts a new one.
/// An error always becomes its own assistant message, even right after
/// an in-progress assistant turn. `done` and unknown events leave the
/// transcript untouched.
#[must_use]
pub fn reduce(transcript: Transcript, event: &ServerEvent) -> Transcript {
    match event {
        ServerEvent::Token { token } => append_token(transcript, token),
        ServerEvent::Error { message } => {
            transcript.with_message(Message::assistant(format!("{ERROR_PREFIX}{message}")))
        }
        ServerEvent::Done { .. } | ServerEvent::Unknown => transcript,
    }
}

fn append_token(mut transcript: Transcript, token: &str) -> Transcript {
    match transcript.messages.pop() {
        Some(last) if last.role == Role::Assistant => {
            let mut content = last.content;
            content.push_str(token);
            transcript.messages.push(Message {
                role: Role::Assistant,
                content,
            });
            transcript
        }
        Some(other) => {
            transcript.messages.push(other);
            transcript.with_message(Message::assistant(token))
        }
        None => transcript.with_message(Message::assistant(token)),
    }
}
