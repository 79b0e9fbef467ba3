use std::sync::Arc;

use tokio::{io::AsyncBufRead, select};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionState},
    frame::read_frame,
    protocol::MAX_USERNAME_LEN,
    router::Router,
};

/// Drives one connection from accept to teardown.
///
/// The first frame is the username. Every frame after that is handed to the
/// router until the peer closes the stream, a read fails, or the connection
/// is evicted because it stopped taking deliveries. Then the connection is
/// unregistered and, if that removed it, the remaining peers get a fresh
/// membership list.
pub async fn run<R>(mut connection: Connection<R>, router: Arc<Router>)
where
    R: AsyncBufRead + Unpin,
{
    if register(&mut connection, &router).await {
        read_loop(&mut connection, &router).await;
    }
    teardown(connection, &router);
}

async fn register<R>(connection: &mut Connection<R>, router: &Router) -> bool
where
    R: AsyncBufRead + Unpin,
{
    let username = match read_frame(connection.reader_mut()).await {
        Ok(Some(username)) => username,
        Ok(None) => {
            debug!(id = connection.id(), "connection closed before registering");
            return false;
        }
        Err(err) => {
            warn!(id = connection.id(), error = ?err, "failed to read username");
            return false;
        }
    };

    if username.len() > MAX_USERNAME_LEN {
        warn!(id = connection.id(), len = username.len(), "username too long");
        return false;
    }

    router
        .registry()
        .register(Arc::clone(connection.handle()), username.clone());
    info!(id = connection.id(), peer = ?connection.peer(), %username, "client joined");
    connection.mark_registered(username);
    router.broadcast_membership();
    true
}

async fn read_loop<R>(connection: &mut Connection<R>, router: &Router)
where
    R: AsyncBufRead + Unpin,
{
    let handle = Arc::clone(connection.handle());
    let id = connection.id();

    loop {
        select! {
            biased;

            _ = handle.evicted() => {
                debug!(id, "connection evicted after failed delivery");
                break;
            }
            frame = read_frame(connection.reader_mut()) => match frame {
                Ok(Some(payload)) => router.handle_inbound(id, &payload),
                Ok(None) => break,
                Err(err) => {
                    warn!(id, error = ?err, "client connection closed with error");
                    break;
                }
            },
        }
    }
}

fn teardown<R>(mut connection: Connection<R>, router: &Router) {
    let previous = connection.mark_closed();
    let removed = router.registry().unregister(connection.id());

    if previous == ConnectionState::Registered {
        info!(
            id = connection.id(),
            peer = ?connection.peer(),
            username = connection.username().unwrap_or_default(),
            "client disconnected"
        );
        // A failed delivery may already have removed and announced us.
        if removed.is_some() {
            router.broadcast_membership();
        }
    }
    // Dropping the last handle lets the writer flush its queue and close the stream.
}
