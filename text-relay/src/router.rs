use std::sync::Arc;

use tracing::debug;

use crate::{
    connection::{ConnectionHandle, ConnectionId},
    protocol::{OutboundMessage, Recipient, ServerToClient},
    registry::Registry,
};

/// Decides where each inbound payload goes and pushes membership updates.
///
/// Delivery only queues frames on each target's outbox, so routing never
/// waits on a peer's socket.
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Routes one `recipient:content` payload from `sender`.
    ///
    /// Malformed payloads and unknown recipients are dropped without any
    /// reply to the sender.
    pub fn handle_inbound(&self, sender: ConnectionId, payload: &str) {
        let message = match OutboundMessage::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(sender, %err, "dropping malformed payload");
                return;
            }
        };

        let targets = match &message.recipient {
            Recipient::All => self.registry.recipients_except(sender),
            Recipient::User(name) => match self.registry.resolve(name) {
                Some(handle) => vec![handle],
                None => {
                    debug!(sender, recipient = %name, "dropping message for unknown recipient");
                    return;
                }
            },
        };

        let relay = ServerToClient::Relay {
            content: message.content,
        };
        if self.deliver(&targets, &relay) {
            self.broadcast_membership();
        }
    }

    /// Sends the current snapshot to every registered connection.
    ///
    /// Peers that cannot take it are unregistered, and the update is
    /// repeated until a round goes out without removing anyone.
    pub fn broadcast_membership(&self) {
        loop {
            let (names, targets) = self.registry.membership();
            let update = ServerToClient::UserList { names };
            if !self.deliver(&targets, &update) {
                break;
            }
        }
    }

    /// Queues `message` on each target in order. A target whose outbox is
    /// full or closed is evicted. Returns true if that removed a registered
    /// user.
    fn deliver(&self, targets: &[Arc<ConnectionHandle>], message: &ServerToClient) -> bool {
        let mut departed = false;
        for target in targets {
            if let Err(err) = target.try_send(message.clone()) {
                debug!(id = target.id(), %err, "failed to deliver message to client");
                target.evict();
                if let Some(username) = self.registry.unregister(target.id()) {
                    debug!(id = target.id(), %username, "removed unreachable client");
                    departed = true;
                }
            }
        }
        departed
    }
}
