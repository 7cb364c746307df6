//! Ordered local view of the conversation and the online-user list.

use std::sync::Arc;

use chrono::{DateTime, Local};

/// Username shown on messages generated by the client or server, not a person.
pub const SYSTEM_USERNAME: &str = "system";

/// Who produced a displayed message, relative to the local session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    SelfSent,
    Other,
    System,
}

/// Binary payload relayed alongside a message. Data stays base64 as received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attachment {
    Image { data: String },
    File { filename: String, data: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayMessage {
    pub username: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
    pub origin: Origin,
    pub attachment: Option<Attachment>,
}

impl DisplayMessage {
    pub fn new(username: impl Into<String>, content: impl Into<String>, origin: Origin) -> Self {
        Self {
            username: username.into(),
            content: content.into(),
            timestamp: Local::now(),
            origin,
            attachment: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SYSTEM_USERNAME, content, Origin::System)
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Whether this message is the `(username, content)` pair named by a
    /// delete request.
    pub fn matches(&self, username: &str, content: &str) -> bool {
        self.username == username && self.content == content
    }

    /// Wall-clock arrival time as `HH:MM:SS`.
    pub fn time_label(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }
}

/// Point-in-time copy of the store. Cloning is cheap; contents never change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub messages: Arc<Vec<DisplayMessage>>,
    pub users: Arc<Vec<String>>,
}

/// Messages in arrival order plus the current online users.
///
/// Both collections are copy-on-write: a snapshot handed out keeps its
/// contents even after later mutations.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Arc<Vec<DisplayMessage>>,
    users: Arc<Vec<String>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: DisplayMessage) {
        Arc::make_mut(&mut self.messages).push(message);
    }

    /// Remove the first message satisfying `predicate`, returning it.
    /// Later messages keep their relative order.
    pub fn remove_first_matching<F>(&mut self, predicate: F) -> Option<DisplayMessage>
    where
        F: Fn(&DisplayMessage) -> bool,
    {
        let index = self.messages.iter().position(predicate)?;
        Some(Arc::make_mut(&mut self.messages).remove(index))
    }

    /// Replace the online users wholesale. Duplicates and empty names are
    /// dropped; first-occurrence order is kept.
    pub fn replace_users<I, S>(&mut self, usernames: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut users: Vec<String> = Vec::new();
        for name in usernames {
            let name = name.into();
            if !name.is_empty() && !users.contains(&name) {
                users.push(name);
            }
        }
        self.users = Arc::new(users);
    }

    pub fn messages(&self) -> Arc<Vec<DisplayMessage>> {
        self.messages.clone()
    }

    pub fn users(&self) -> Arc<Vec<String>> {
        self.users.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            messages: self.messages.clone(),
            users: self.users.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(username: &str, content: &str) -> DisplayMessage {
        let origin = if username == "alice" {
            Origin::SelfSent
        } else {
            Origin::Other
        };
        DisplayMessage::new(username, content, origin)
    }

    fn pairs(store: &MessageStore) -> Vec<(String, String)> {
        store
            .messages()
            .iter()
            .map(|m| (m.username.clone(), m.content.clone()))
            .collect()
    }

    #[test]
    fn append_keeps_arrival_order() {
        let mut store = MessageStore::new();
        store.append(msg("alice", "hi"));
        store.append(msg("bob", "yo"));
        store.append(msg("carol", "hey"));
        assert_eq!(
            pairs(&store),
            vec![
                ("alice".into(), "hi".into()),
                ("bob".into(), "yo".into()),
                ("carol".into(), "hey".into()),
            ]
        );
    }

    #[test]
    fn duplicates_from_different_senders_coexist() {
        let mut store = MessageStore::new();
        store.append(msg("alice", "same"));
        store.append(msg("bob", "same"));
        store.append(msg("alice", "same"));
        assert_eq!(store.len(), 3);

        // Removing bob's copy leaves both of alice's in place
        let removed = store.remove_first_matching(|m| m.matches("bob", "same"));
        assert_eq!(removed.unwrap().username, "bob");
        assert_eq!(
            pairs(&store),
            vec![
                ("alice".into(), "same".into()),
                ("alice".into(), "same".into()),
            ]
        );
    }

    #[test]
    fn remove_first_matching_removes_only_first() {
        let mut store = MessageStore::new();
        store.append(msg("alice", "a"));
        store.append(msg("alice", "b"));
        store.append(msg("alice", "a"));

        store.remove_first_matching(|m| m.matches("alice", "a"));
        assert_eq!(
            pairs(&store),
            vec![("alice".into(), "b".into()), ("alice".into(), "a".into())]
        );
    }

    #[test]
    fn remove_without_match_is_noop() {
        let mut store = MessageStore::new();
        store.append(msg("alice", "hi"));
        assert!(store.remove_first_matching(|m| m.matches("bob", "hi")).is_none());
        assert_eq!(store.len(), 1);

        let mut empty = MessageStore::new();
        assert!(empty.remove_first_matching(|_| true).is_none());
    }

    #[test]
    fn mixed_operations_match_vec_model() {
        let mut store = MessageStore::new();
        let mut model: Vec<(String, String)> = Vec::new();

        let ops: &[(&str, &str, bool)] = &[
            ("alice", "1", false),
            ("bob", "2", false),
            ("alice", "3", false),
            ("bob", "2", true),
            ("carol", "4", false),
            ("alice", "1", true),
            ("alice", "5", false),
            ("dave", "missing", true),
            ("bob", "2", false),
        ];
        for &(user, content, remove) in ops {
            if remove {
                store.remove_first_matching(|m| m.matches(user, content));
                if let Some(i) = model.iter().position(|(u, c)| u == user && c == content) {
                    model.remove(i);
                }
            } else {
                store.append(msg(user, content));
                model.push((user.into(), content.into()));
            }
            assert_eq!(pairs(&store), model);
        }
    }

    #[test]
    fn replace_users_discards_previous_set() {
        let mut store = MessageStore::new();
        store.replace_users(["dave", "erin"]);
        store.replace_users(["alice", "bob", "carol"]);
        assert_eq!(*store.users(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn replace_users_collapses_duplicates_and_blanks() {
        let mut store = MessageStore::new();
        store.replace_users(["bob", "", "alice", "bob"]);
        assert_eq!(*store.users(), vec!["bob", "alice"]);
    }

    #[test]
    fn snapshot_is_isolated_from_later_mutation() {
        let mut store = MessageStore::new();
        store.append(msg("alice", "hi"));
        store.replace_users(["alice"]);

        let snapshot = store.snapshot();
        store.append(msg("bob", "yo"));
        store.remove_first_matching(|m| m.matches("alice", "hi"));
        store.replace_users(["bob"]);

        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].content, "hi");
        assert_eq!(*snapshot.users, vec!["alice"]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].content, "yo");
    }

    #[test]
    fn system_message_shape() {
        let notice = DisplayMessage::system("connected");
        assert_eq!(notice.username, SYSTEM_USERNAME);
        assert_eq!(notice.origin, Origin::System);
        assert!(notice.attachment.is_none());
        assert_eq!(notice.time_label().len(), 8);
    }
}
