//! Payload grammar carried inside each frame.
//!
//! After the username frame, every client payload reads
//! `<recipient>:<content>`, where the recipient is either [`BROADCAST_TARGET`]
//! or an exact username. The server answers with either a bare relayed
//! content string or a `USERLIST:` membership update.

use thiserror::Error;

/// Reserved recipient name that addresses every connected peer.
pub const BROADCAST_TARGET: &str = "All";

/// Prefix marking a membership update sent by the server.
pub const USERLIST_PREFIX: &str = "USERLIST:";

/// Longest username, in bytes, a connection may register with.
pub const MAX_USERNAME_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    All,
    User(String),
}

impl Recipient {
    fn from_wire(name: &str) -> Self {
        if name == BROADCAST_TARGET {
            Recipient::All
        } else {
            Recipient::User(name.to_string())
        }
    }
}

/// A routed message: who it is for and what to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient: Recipient,
    pub content: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("payload has no recipient separator")]
pub struct MalformedPayload;

impl OutboundMessage {
    /// Splits on the first colon only; the content may contain more colons.
    pub fn parse(payload: &str) -> Result<Self, MalformedPayload> {
        let (recipient, content) = payload.split_once(':').ok_or(MalformedPayload)?;
        Ok(Self {
            recipient: Recipient::from_wire(recipient),
            content: content.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        match &self.recipient {
            Recipient::All => format!("{BROADCAST_TARGET}:{}", self.content),
            Recipient::User(name) => format!("{name}:{}", self.content),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerToClient {
    /// Message content relayed verbatim, without any sender prefix.
    Relay { content: String },
    /// Every registered username, led by [`BROADCAST_TARGET`].
    UserList { names: Vec<String> },
}

impl ServerToClient {
    pub fn encode(&self) -> String {
        match self {
            ServerToClient::Relay { content } => content.clone(),
            ServerToClient::UserList { names } => format!("{USERLIST_PREFIX}{}", names.join(",")),
        }
    }

    /// Inverse of [`ServerToClient::encode`]. Relayed content that happens to
    /// start with the userlist prefix cannot be told apart on the wire.
    pub fn decode(payload: &str) -> Self {
        match payload.strip_prefix(USERLIST_PREFIX) {
            Some(list) => ServerToClient::UserList {
                names: list
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            None => ServerToClient::Relay {
                content: payload.to_string(),
            },
        }
    }
}
