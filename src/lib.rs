//! Client-side session manager for a streaming chat socket
//!
//! A prompt opens one socket to the model server, the reply streams back as
//! token events that are folded into the transcript, and a cancel asks the
//! server to stop early. Starting a new prompt always supersedes the previous
//! session.

pub mod config;
pub mod protocol;
pub mod runtime;
pub mod state_machine;
pub mod transcript;

pub use config::ChatConfig;
pub use protocol::{Message, Role, ServerEvent};
pub use runtime::{start, SessionHandle, SessionUpdate, WsConnector};
pub use transcript::{reduce, Transcript};
