//! Session engine: the façade a presentation shell talks to.
//!
//! The engine owns the [`MessageStore`] and the current [`Session`], turns user
//! intents into protocol events for the [`Supervisor`], and applies inbound
//! events to the store. Every store mutation and connection-state change is
//! pushed to subscribed listeners before the mutating call returns.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{EchoPolicy, SessionConfig};
use crate::endpoint::Endpoint;
use crate::error::ChatError;
use crate::protocol::ChatEvent;
use crate::store::{Attachment, DisplayMessage, MessageStore, Origin, StoreSnapshot};
use crate::supervisor::{ConnectionState, StateCause, Supervisor, SupervisorEvent, SupervisorSink};

/// Upper bound on optimistic sends awaiting their server echo.
const MAX_PENDING_ECHOES: usize = 64;

/// The local user's presence in the chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub connection_state: ConnectionState,
}

/// Change notification delivered to listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    ConnectionStateChanged(ConnectionState),
    MessagesChanged(Arc<Vec<DisplayMessage>>),
    UsersChanged(Arc<Vec<String>>),
}

/// Receives every [`SessionUpdate`] in order.
///
/// Called with the engine's internal lock held: implementations must return
/// quickly and must not call back into the engine. Use
/// [`SessionEngine::updates`] when the consumer needs to react with engine calls.
pub trait SessionListener: Send + Sync + 'static {
    fn on_update(&self, update: &SessionUpdate);
}

impl<F> SessionListener for F
where
    F: Fn(&SessionUpdate) + Send + Sync + 'static,
{
    fn on_update(&self, update: &SessionUpdate) {
        self(update)
    }
}

struct CoreState {
    store: MessageStore,
    session: Option<Session>,
    listeners: Vec<Arc<dyn SessionListener>>,
    /// Contents of own messages appended optimistically whose server echo
    /// has not arrived yet, oldest first.
    pending_echoes: VecDeque<String>,
}

impl CoreState {
    fn emit(&self, update: SessionUpdate) {
        for listener in &self.listeners {
            listener.on_update(&update);
        }
    }

    fn append(&mut self, message: DisplayMessage) {
        self.store.append(message);
        self.emit(SessionUpdate::MessagesChanged(self.store.messages()));
    }

    fn notice(&mut self, content: impl Into<String>) {
        self.append(DisplayMessage::system(content));
    }

    fn username(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.username.as_str())
    }

    fn origin_of(&self, username: &str) -> Origin {
        if self.username() == Some(username) {
            Origin::SelfSent
        } else {
            Origin::Other
        }
    }

    fn on_state_changed(&mut self, state: ConnectionState, cause: StateCause) {
        if let Some(session) = self.session.as_mut() {
            session.connection_state = state.clone();
        }
        self.emit(SessionUpdate::ConnectionStateChanged(state.clone()));

        match (&state, cause) {
            (ConnectionState::Connected, StateCause::HandshakeCompleted { resumed: false }) => {
                let name = self.username().unwrap_or_default().to_string();
                info!(username = %name, "session established");
                self.notice(format!("connected as {name}"));
            }
            (ConnectionState::Connected, StateCause::HandshakeCompleted { resumed: true }) => {
                info!("session resumed");
                self.notice("reconnected");
            }
            (ConnectionState::Reconnecting { delay, .. }, StateCause::ConnectionLost(reason)) => {
                // Echoes still in flight on the dead link will never arrive
                self.pending_echoes.clear();
                self.notice(format!("connection lost ({reason}); reconnecting in {delay:?}"));
            }
            (
                ConnectionState::Reconnecting { attempt, delay },
                StateCause::RetryFailed(reason),
            ) => {
                self.notice(format!(
                    "reconnect failed ({reason}); attempt {attempt} in {delay:?}"
                ));
            }
            (ConnectionState::Disconnected, StateCause::GaveUp { attempts }) => {
                self.end_session();
                self.notice(format!(
                    "could not reconnect after {attempts} attempts; session ended"
                ));
            }
            (ConnectionState::Disconnected, StateCause::Requested) => {
                self.end_session();
                self.notice("disconnected");
            }
            (ConnectionState::Disconnected, StateCause::ConnectFailed(_)) => {
                self.end_session();
            }
            _ => {}
        }
    }

    fn end_session(&mut self) {
        self.session = None;
        self.pending_echoes.clear();
    }

    fn on_event(&mut self, event: ChatEvent, echo: EchoPolicy) {
        match event {
            // Only meaningful as the first frame of the handshake
            ChatEvent::UsernameAnnounce { .. } => {}
            ChatEvent::ChatPosted { username, content } => {
                let origin = self.origin_of(&username);
                if origin == Origin::SelfSent && echo == EchoPolicy::Optimistic {
                    if let Some(i) = self.pending_echoes.iter().position(|c| *c == content) {
                        self.pending_echoes.remove(i);
                        debug!("suppressed server echo of own message");
                        return;
                    }
                }
                self.append(DisplayMessage::new(username, content, origin));
            }
            ChatEvent::ImagePosted {
                username,
                content,
                image_data,
            } => {
                let origin = self.origin_of(&username);
                let message = DisplayMessage::new(username, content, origin)
                    .with_attachment(Attachment::Image { data: image_data });
                self.append(message);
            }
            ChatEvent::FilePosted {
                username,
                content,
                filename,
                file_data,
            } => {
                let origin = self.origin_of(&username);
                let message = DisplayMessage::new(username, content, origin).with_attachment(
                    Attachment::File {
                        filename,
                        data: file_data,
                    },
                );
                self.append(message);
            }
            ChatEvent::SystemNotice { content } => {
                self.notice(content);
            }
            ChatEvent::UserListReplace { usernames } => {
                self.store.replace_users(usernames);
                self.emit(SessionUpdate::UsersChanged(self.store.users()));
            }
            ChatEvent::DeleteRequest { username, content } => {
                if self
                    .store
                    .remove_first_matching(|m| m.matches(&username, &content))
                    .is_some()
                {
                    self.emit(SessionUpdate::MessagesChanged(self.store.messages()));
                } else {
                    debug!(username = %username, "delete request matched no message");
                }
            }
        }
    }
}

/// Shared between the engine and the supervisor, which feeds it events.
struct Core {
    state: Mutex<CoreState>,
    echo: EchoPolicy,
}

impl SupervisorSink for Core {
    fn notify(&self, event: SupervisorEvent) {
        let mut state = self.state.lock();
        match event {
            SupervisorEvent::StateChanged { state: conn, cause } => {
                state.on_state_changed(conn, cause)
            }
            SupervisorEvent::Received(event) => state.on_event(event, self.echo),
        }
    }
}

/// Client-side chat session engine.
pub struct SessionEngine {
    core: Arc<Core>,
    supervisor: Supervisor,
    config: SessionConfig,
}

impl SessionEngine {
    pub fn new(config: SessionConfig) -> Self {
        let core = Arc::new(Core {
            state: Mutex::new(CoreState {
                store: MessageStore::new(),
                session: None,
                listeners: Vec::new(),
                pending_echoes: VecDeque::new(),
            }),
            echo: config.echo,
        });
        let supervisor = Supervisor::new(
            core.clone(),
            config.reconnect.clone(),
            config.connect_timeout,
        );
        Self {
            core,
            supervisor,
            config,
        }
    }

    /// Begin a session as `desired_username` against `endpoint`.
    ///
    /// Fails with [`ChatError::InvalidUsername`] or [`ChatError::Connect`]
    /// before touching the network when the inputs are unusable.
    pub async fn start(&self, endpoint: &str, desired_username: &str) -> Result<(), ChatError> {
        let username = desired_username.trim();
        if username.is_empty() {
            return Err(ChatError::InvalidUsername);
        }
        let mut endpoint = Endpoint::parse(endpoint)?;
        if self.config.username_in_url {
            endpoint = endpoint.with_username_query(username);
        }

        {
            let mut state = self.core.state.lock();
            if state.session.is_some() {
                return Err(ChatError::AlreadyStarted);
            }
            state.session = Some(Session {
                username: username.to_string(),
                connection_state: ConnectionState::Disconnected,
            });
        }

        let result = self.supervisor.connect(endpoint, username).await;
        if let Err(ChatError::AlreadyStarted) = result {
            // The supervisor still holds an earlier link; nothing was started
            let mut state = self.core.state.lock();
            if state.username() == Some(username) {
                state.session = None;
            }
        }
        result
    }

    /// Send a chat message as the session user.
    pub async fn post_message(&self, content: &str) -> Result<(), ChatError> {
        self.validate_content(content)?;
        let optimistic = self.config.echo == EchoPolicy::Optimistic;

        // The echo may be decoded before send() returns, so it must already
        // be expected by then.
        let username = {
            let mut state = self.core.state.lock();
            let username = state
                .username()
                .map(str::to_string)
                .ok_or(ChatError::NotConnected)?;
            if optimistic {
                if state.pending_echoes.len() == MAX_PENDING_ECHOES {
                    state.pending_echoes.pop_front();
                }
                state.pending_echoes.push_back(content.to_string());
            }
            username
        };

        let event = ChatEvent::ChatPosted {
            username: username.clone(),
            content: content.to_string(),
        };
        if let Err(e) = self.supervisor.send(&event).await {
            if optimistic {
                let mut state = self.core.state.lock();
                if let Some(i) = state.pending_echoes.iter().rposition(|c| c == content) {
                    state.pending_echoes.remove(i);
                }
            }
            return Err(e);
        }

        if optimistic {
            let mut state = self.core.state.lock();
            state.append(DisplayMessage::new(username, content, Origin::SelfSent));
        }
        Ok(())
    }

    /// Delete one of the session user's own messages, locally and remotely.
    ///
    /// The local removal stands even when the send fails; the error is
    /// returned so the caller can tell the user.
    pub async fn request_delete(&self, content: &str) -> Result<(), ChatError> {
        let username = {
            let mut state = self.core.state.lock();
            let username = state
                .username()
                .map(str::to_string)
                .ok_or(ChatError::NotConnected)?;
            let owned = |m: &DisplayMessage| m.origin == Origin::SelfSent && m.matches(&username, content);
            if state.store.remove_first_matching(owned).is_none() {
                return Err(ChatError::NotOwner);
            }
            state.emit(SessionUpdate::MessagesChanged(state.store.messages()));
            username
        };

        let event = ChatEvent::DeleteRequest {
            username,
            content: content.to_string(),
        };
        if let Err(e) = self.supervisor.send(&event).await {
            warn!(error = %e, "delete request not delivered; kept local removal");
            return Err(e);
        }
        Ok(())
    }

    /// Close the connection and end the session.
    pub async fn stop(&self) -> Result<(), ChatError> {
        self.supervisor.disconnect().await
    }

    pub fn subscribe(&self, listener: impl SessionListener) {
        self.core.state.lock().listeners.push(Arc::new(listener));
    }

    /// Channel fed with every update, for consumers that call back into the
    /// engine. The channel closes when the engine is dropped.
    pub fn updates(&self) -> mpsc::UnboundedReceiver<SessionUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |update: &SessionUpdate| {
            let _ = tx.send(update.clone());
        });
        rx
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.core.state.lock().store.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn username(&self) -> Option<String> {
        self.core.state.lock().username().map(str::to_string)
    }

    /// Current session, if one exists.
    pub fn session(&self) -> Option<Session> {
        self.core.state.lock().session.clone()
    }

    fn validate_content(&self, content: &str) -> Result<(), ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message is empty".into()));
        }
        let chars = content.chars().count();
        if chars > self.config.max_content_chars {
            return Err(ChatError::Validation(format!(
                "message is {chars} characters; the limit is {}",
                self.config.max_content_chars
            )));
        }
        Ok(())
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        // Listeners (and the updates() senders) are released with the
        // engine even though supervisor tasks may still hold the core.
        self.core.state.lock().listeners.clear();
    }
}
