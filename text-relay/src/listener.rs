use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
};
use tracing::{info, warn};

use crate::{
    connection::{Connection, ConnectionId},
    registry::Registry,
    router::Router,
    session,
};

/// Accepts connections and runs one session task per stream.
pub struct Listener {
    listener: TcpListener,
    router: Arc<Router>,
    next_id: AtomicU64,
}

impl Listener {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            router: Arc::new(Router::new(Arc::new(Registry::new()))),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn bind<A>(addr: A) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind relay listener")?;
        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Accepts until `shutdown` resolves. Live sessions are not drained;
    /// they keep running until the runtime itself stops.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = self.listener.accept() => {
                    self.handle_accept_result(accept_result);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    fn handle_accept_result(&self, result: std::io::Result<(TcpStream, SocketAddr)>) {
        match result {
            Ok((stream, peer)) => self.spawn_session(stream, peer),
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id();
        info!(id, %peer, "new connection");
        let connection = Connection::from_tcp(id, stream);
        tokio::spawn(session::run(connection, Arc::clone(&self.router)));
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
