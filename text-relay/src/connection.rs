use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::{
        Notify,
        mpsc::{self, error::TrySendError},
    },
};
use tracing::{debug, warn};

use crate::{frame::encode_frame, protocol::ServerToClient};

pub type ConnectionId = u64;

/// Frames a connection may have queued before it counts as unreachable.
pub const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbox is full")]
    Full,
    #[error("connection writer has stopped")]
    Closed,
}

/// Write side of a connection, shared between its own worker and the registry.
///
/// Frames are queued on a bounded outbox and written by a dedicated task, so
/// a peer that stops reading never blocks the worker that addressed it. The
/// read side lives in [`Connection`] and is only touched by the owning worker.
pub struct ConnectionHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<ServerToClient>,
    evicted: Arc<Notify>,
}

impl ConnectionHandle {
    /// Creates a handle whose outbox is drained by the caller.
    pub fn new(id: ConnectionId) -> (Self, mpsc::Receiver<ServerToClient>) {
        let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);
        let handle = Self {
            id,
            outbox,
            evicted: Arc::new(Notify::new()),
        };
        (handle, inbox)
    }

    /// Creates a handle and spawns the task that writes its frames to `writer`.
    ///
    /// The task shuts the writer down once every handle is dropped and the
    /// queued frames are flushed.
    pub fn spawn<W>(id: ConnectionId, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (handle, inbox) = Self::new(id);
        tokio::spawn(drain_outbox(
            id,
            inbox,
            writer,
            Arc::clone(&handle.evicted),
        ));
        Arc::new(handle)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `message` without waiting.
    pub fn try_send(&self, message: ServerToClient) -> Result<(), DeliveryError> {
        self.outbox.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Asks the owning worker to stop reading and tear the connection down.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Resolves once [`ConnectionHandle::evict`] has been called.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

async fn drain_outbox<W>(
    id: ConnectionId,
    mut inbox: mpsc::Receiver<ServerToClient>,
    mut writer: W,
    evicted: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = inbox.recv().await {
        // Encoding problems are ours, not the peer's: drop the frame, keep the peer.
        let frame = match encode_frame(&message.encode()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(id, error = ?err, "dropping unencodable frame");
                continue;
            }
        };

        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(err) = written.await {
            debug!(id, ?err, "failed to deliver message to client");
            evicted.notify_one();
            return;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(id, ?err, "failed to shut down client writer cleanly");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, waiting for the username frame.
    Connecting,
    /// Present in the registry and routing messages.
    Registered,
    /// Terminal.
    Closed,
}

/// One accepted stream, owned by its session worker.
pub struct Connection<R> {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    reader: R,
    handle: Arc<ConnectionHandle>,
    state: ConnectionState,
    username: Option<String>,
}

impl Connection<BufReader<OwnedReadHalf>> {
    pub fn from_tcp(id: ConnectionId, stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::new(
            id,
            peer,
            BufReader::new(reader),
            ConnectionHandle::spawn(id, writer),
        )
    }
}

impl<R> Connection<R> {
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        reader: R,
        handle: Arc<ConnectionHandle>,
    ) -> Self {
        Self {
            id,
            peer,
            reader,
            handle,
            state: ConnectionState::Connecting,
            username: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub(crate) fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// `Connecting -> Registered`. Returns false from any other state.
    pub(crate) fn mark_registered(&mut self, username: String) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Registered;
        self.username = Some(username);
        true
    }

    /// Moves to `Closed` and returns the state the connection left.
    pub(crate) fn mark_closed(&mut self) -> ConnectionState {
        std::mem::replace(&mut self.state, ConnectionState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::frame::read_frame;

    fn detached_connection(id: ConnectionId) -> Connection<()> {
        let (handle, _inbox) = ConnectionHandle::new(id);
        Connection::new(id, None, (), Arc::new(handle))
    }

    fn relay(content: &str) -> ServerToClient {
        ServerToClient::Relay {
            content: content.to_string(),
        }
    }

    #[test]
    fn registers_once_then_closes() {
        let mut connection = detached_connection(1);
        assert_eq!(connection.state(), ConnectionState::Connecting);

        assert!(connection.mark_registered("alice".into()));
        assert_eq!(connection.state(), ConnectionState::Registered);
        assert_eq!(connection.username(), Some("alice"));
        assert!(!connection.mark_registered("mallory".into()));
        assert_eq!(connection.username(), Some("alice"));

        assert_eq!(connection.mark_closed(), ConnectionState::Registered);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn closed_connection_cannot_register() {
        let mut connection = detached_connection(2);

        assert_eq!(connection.mark_closed(), ConnectionState::Connecting);
        assert!(!connection.mark_registered("late".into()));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn queued_frames_are_written_in_order() {
        let (server_side, peer) = tokio::io::duplex(1024);
        let handle = ConnectionHandle::spawn(3, server_side);
        let mut peer = BufReader::new(peer);

        handle.try_send(relay("first")).expect("queue first");
        handle.try_send(relay("second")).expect("queue second");

        assert_eq!(read_frame(&mut peer).await.unwrap().as_deref(), Some("first"));
        assert_eq!(read_frame(&mut peer).await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn unencodable_frame_is_skipped_without_eviction() {
        let (server_side, peer) = tokio::io::duplex(1024);
        let handle = ConnectionHandle::spawn(4, server_side);
        let mut peer = BufReader::new(peer);

        handle.try_send(relay("two\nlines")).expect("queue bad frame");
        handle.try_send(relay("fine")).expect("queue good frame");

        assert_eq!(read_frame(&mut peer).await.unwrap().as_deref(), Some("fine"));
        let evicted = timeout(Duration::from_millis(100), handle.evicted()).await;
        assert!(evicted.is_err(), "healthy peer was evicted");
        assert_eq!(handle.try_send(relay("still open")), Ok(()));
    }

    #[tokio::test]
    async fn write_failure_evicts_connection() {
        let (server_side, peer) = tokio::io::duplex(1024);
        let handle = ConnectionHandle::spawn(5, server_side);
        drop(peer);

        handle.try_send(relay("anyone?")).expect("queue frame");

        timeout(Duration::from_secs(1), handle.evicted())
            .await
            .expect("connection should be evicted");
    }

    #[test]
    fn full_or_closed_outbox_is_a_delivery_failure() {
        let (handle, inbox) = ConnectionHandle::new(6);
        for n in 0..OUTBOX_CAPACITY {
            handle
                .try_send(relay(&format!("message {n}")))
                .expect("queue within capacity");
        }
        assert_eq!(handle.try_send(relay("one too many")), Err(DeliveryError::Full));

        drop(inbox);
        assert_eq!(handle.try_send(relay("nobody home")), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn dropping_last_handle_closes_stream() {
        let (server_side, peer) = tokio::io::duplex(1024);
        let handle = ConnectionHandle::spawn(7, server_side);
        let mut peer = BufReader::new(peer);

        handle.try_send(relay("bye")).expect("queue frame");
        drop(handle);

        assert_eq!(read_frame(&mut peer).await.unwrap().as_deref(), Some("bye"));
        assert_eq!(read_frame(&mut peer).await.unwrap(), None);
    }
}
