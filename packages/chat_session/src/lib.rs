//! Chat Session - client-side chat session engine
//!
//! This crate owns everything a chat client needs below its presentation layer:
//! the JSON wire codec, a supervised WebSocket connection with a username
//! handshake and capped reconnection, and the ordered local message view.
//! It has no UI dependencies; shells observe snapshots through listeners.
//!
//! # Example
//!
//! ```no_run
//! use chat_session::{SessionConfig, SessionEngine, SessionUpdate};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = SessionEngine::new(SessionConfig::default());
//!     let mut updates = engine.updates();
//!
//!     engine.start("ws://localhost:8080/ws", "alice").await.unwrap();
//!
//!     while let Some(update) = updates.recv().await {
//!         match update {
//!             SessionUpdate::ConnectionStateChanged(state) => {
//!                 println!("state: {state}");
//!             }
//!             SessionUpdate::MessagesChanged(messages) => {
//!                 if let Some(last) = messages.last() {
//!                     println!("{}: {}", last.username, last.content);
//!                 }
//!             }
//!             SessionUpdate::UsersChanged(users) => {
//!                 println!("online: {}", users.join(", "));
//!             }
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod endpoint;
mod error;
pub mod protocol;
mod session;
pub mod store;
mod supervisor;

#[cfg(test)]
mod test_support;

pub use config::{EchoPolicy, ReconnectPolicy, SessionConfig};
pub use endpoint::Endpoint;
pub use error::{ChatError, DecodeError, EncodeError};
pub use protocol::ChatEvent;
pub use session::{Session, SessionEngine, SessionListener, SessionUpdate};
pub use store::{Attachment, DisplayMessage, MessageStore, Origin, StoreSnapshot};
pub use supervisor::{ConnectionState, StateCause, Supervisor, SupervisorEvent, SupervisorSink};
