//! Pure state transition function

use super::{ChatContext, ChatState, Effect, Event, SessionId, SessionState};
use crate::protocol::{ClientFrame, Message, SendRequest, ServerEvent};
use crate::transcript::reduce;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ChatState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ChatState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    /// The event has no consequence in the current state
    pub fn unchanged(state: &ChatState) -> Self {
        Self::new(state.clone())
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// User intents the controller refuses
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Prompt is empty")]
    EmptyPrompt,
    #[error("No model selected")]
    NoModelSelected,
    #[error("Unknown model: {0}")]
    UnknownModel(String),
}

/// Pure transition function.
///
/// Given the same inputs it always yields the same outputs. Connection events
/// for any session other than the current one are ignored, which keeps a
/// superseded stream out of the new conversation.
pub fn transition(
    state: &ChatState,
    context: &ChatContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match event {
        Event::UserSend { text, session } => start_session(state, text, session),

        Event::UserCancel => Ok(cancel(state)),

        Event::SelectModels { models } => {
            if let Some(unknown) = models.iter().find(|m| !context.knows_model(m)) {
                return Err(TransitionError::UnknownModel(unknown.clone()));
            }
            Ok(TransitionResult::new(ChatState {
                models,
                ..state.clone()
            }))
        }

        // Connecting + Connected -> Streaming, the request goes out immediately
        Event::Connected { session } => match &state.session {
            SessionState::Connecting {
                session: current,
                request,
            } if *current == session => Ok(TransitionResult::new(ChatState {
                session: SessionState::Streaming {
                    session,
                    cancel_sent: false,
                },
                ..state.clone()
            })
            .with_effect(Effect::send_frame(
                session,
                ClientFrame::Send(request.clone()),
            ))
            .with_effect(Effect::PublishStatus)),
            _ => Ok(TransitionResult::unchanged(state)),
        },

        Event::Frame { session, event } => Ok(apply_frame(state, session, &event)),

        Event::ConnectFailed { session, .. } | Event::Closed { session } => {
            if state.session.is_current(session) {
                Ok(TransitionResult::new(ChatState {
                    session: SessionState::Idle,
                    ..state.clone()
                })
                .with_effect(Effect::ReleaseConnection { session })
                .with_effect(Effect::PublishStatus))
            } else {
                Ok(TransitionResult::unchanged(state))
            }
        }
    }
}

/// Any state + `UserSend` -> Connecting, superseding whatever session was live
fn start_session(
    state: &ChatState,
    text: String,
    session: SessionId,
) -> Result<TransitionResult, TransitionError> {
    if text.trim().is_empty() {
        return Err(TransitionError::EmptyPrompt);
    }
    if state.models.is_empty() {
        return Err(TransitionError::NoModelSelected);
    }

    let transcript = state.transcript.clone().with_message(Message::user(text));
    let request = SendRequest {
        model: state.models.clone(),
        messages: transcript.messages().to_vec(),
    };

    // The old socket must be closed before the new one is opened
    let supersede = state
        .session
        .session()
        .map(|old| Effect::CloseConnection { session: old });

    Ok(TransitionResult::new(ChatState {
        session: SessionState::Connecting { session, request },
        transcript,
        models: state.models.clone(),
    })
    .with_effects(supersede)
    .with_effect(Effect::PublishTranscript)
    .with_effect(Effect::OpenConnection { session })
    .with_effect(Effect::PublishStatus))
}

/// Cancel is honored once per session, and only while streaming
fn cancel(state: &ChatState) -> TransitionResult {
    match state.session {
        SessionState::Streaming {
            session,
            cancel_sent: false,
        } => TransitionResult::new(ChatState {
            session: SessionState::Streaming {
                session,
                cancel_sent: true,
            },
            ..state.clone()
        })
        .with_effect(Effect::send_frame(session, ClientFrame::cancel())),
        _ => TransitionResult::unchanged(state),
    }
}

fn apply_frame(state: &ChatState, session: SessionId, event: &ServerEvent) -> TransitionResult {
    let SessionState::Streaming { session: current, .. } = state.session else {
        return TransitionResult::unchanged(state);
    };
    if current != session {
        return TransitionResult::unchanged(state);
    }

    match event {
        ServerEvent::Token { .. } | ServerEvent::Error { .. } => {
            TransitionResult::new(ChatState {
                transcript: reduce(state.transcript.clone(), event),
                ..state.clone()
            })
            .with_effect(Effect::PublishTranscript)
        }
        ServerEvent::Done { duration } => TransitionResult::unchanged(state)
            .with_effect(Effect::NotifyTurnComplete {
                duration: *duration,
            }),
        ServerEvent::Unknown => TransitionResult::unchanged(state),
    }
}
