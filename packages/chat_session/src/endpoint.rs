//! Chat server endpoint parsing.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::ChatError;

/// A validated `ws://` or `wss://` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint(Url);

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| ChatError::Connect(format!("invalid endpoint {raw:?}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self(url)),
            other => Err(ChatError::Connect(format!(
                "unsupported scheme {other:?} (expected ws or wss)"
            ))),
        }
    }

    /// Copy of this endpoint carrying `?username=<name>`, replacing any
    /// existing `username` parameter.
    pub fn with_username_query(&self, username: &str) -> Self {
        let mut url = self.0.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "username")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("username", username);
        Self(url)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
