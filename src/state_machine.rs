//! Session controller state machine
//!
//! Pure transitions over `(ChatState, ChatContext, Event)`; all socket I/O is
//! described as [`Effect`]s and carried out by the runtime.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;


pub use effect::Effect;
pub use event::Event;
pub use state::{ChatContext, ChatState, SessionId, SessionState, SessionStatus};
pub use transition::{transition, TransitionError, TransitionResult};
