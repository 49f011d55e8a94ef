//! Relay server: listening endpoint, accept loop and shutdown.
//!
//! State machine: `Idle → Listening → Stopping → Idle`. A server can be
//! started again after `stop()`; each run gets a fresh listening socket and
//! an empty registry.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use hiroba_shared::ChatMessage;
use tokio::{
    net::TcpListener,
    sync::{Mutex, watch},
    task::{JoinHandle, JoinSet},
};

use crate::{
    error::ServerError,
    handler::ConnectionHandler,
    registry::{ConnectionId, Registry},
};

/// How long `stop()` waits for handlers to flush and close.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Pause after an unexpected accept failure before retrying.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Notice broadcast to every connection right before `stop()` closes them.
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down";

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0", "127.0.0.1")
    pub host: String,
    /// Broadcast a system notice whenever a connection is accepted
    pub announce_joins: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            announce_joins: true,
        }
    }
}

/// State of one server run, shared with every handler it spawns.
pub(crate) struct ServerShared {
    running: AtomicBool,
    announce_joins: bool,
    next_id: AtomicU64,
    pub(crate) registry: Registry,
}

impl ServerShared {
    pub(crate) fn new(announce_joins: bool) -> Self {
        Self {
            running: AtomicBool::new(true),
            announce_joins,
            next_id: AtomicU64::new(1),
            registry: Registry::new(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) async fn broadcast(&self, message: &ChatMessage) -> usize {
        self.registry.broadcast(message).await
    }
}

struct Listening {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<JoinSet<()>>,
}

/// TCP broadcast relay
///
/// # Example
///
/// ```ignore
/// let server = RelayServer::new(ServerConfig::default());
/// let addr = server.start(8080).await?;
/// println!("{} clients", server.connected_clients().await);
/// server.stop().await;
/// ```
pub struct RelayServer {
    config: ServerConfig,
    listening: Mutex<Option<Listening>>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            listening: Mutex::new(None),
        }
    }

    /// Bind the listening endpoint and start accepting connections.
    ///
    /// Port `0` lets the OS pick a free port; the bound address is returned.
    ///
    /// # Errors
    ///
    /// * `ServerError::Bind` - the address is in use or cannot be bound
    /// * `ServerError::AlreadyRunning` - the server is already listening
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let mut listening = self.listening.lock().await;
        if listening.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = format!("{}:{}", self.config.host, port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;

        let shared = Arc::new(ServerShared::new(self.config.announce_joins));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        tracing::info!("Relay server listening on {}", local_addr);

        *listening = Some(Listening {
            shared,
            local_addr,
            shutdown_tx,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stop accepting, announce the shutdown and close every connection.
    ///
    /// Calling this on a stopped server does nothing. When it returns the
    /// listening socket is released and `connected_clients()` is zero.
    pub async fn stop(&self) {
        let mut listening = self.listening.lock().await;
        let Some(Listening {
            shared,
            local_addr,
            shutdown_tx,
            accept_task,
        }) = listening.take()
        else {
            tracing::debug!("Relay server is not running; nothing to stop");
            return;
        };

        tracing::info!("Stopping relay server on {}", local_addr);

        // Accept failures from here on are expected and swallowed.
        shared.running.store(false, Ordering::SeqCst);
        let _ = shutdown_tx.send(true);

        let mut handlers = match accept_task.await {
            Ok(handlers) => handlers,
            Err(e) => {
                tracing::warn!("Accept loop ended abnormally: {}", e);
                JoinSet::new()
            }
        };

        shared
            .broadcast(&ChatMessage::system(SHUTDOWN_NOTICE))
            .await;

        let entries = shared.registry.drain().await;
        let closed = entries.len();
        for entry in entries {
            entry.close();
        }

        let finished = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = handlers.join_next().await {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::warn!("Connection handler panicked: {}", e);
                }
            }
        })
        .await;
        if finished.is_err() {
            tracing::warn!(
                "{} connection(s) did not close within {:?}; aborting them",
                handlers.len(),
                SHUTDOWN_GRACE
            );
            handlers.shutdown().await;
        }

        tracing::info!(
            "Relay server stopped ({} connection(s) closed)",
            closed
        );
    }

    /// Deliver `message` to every registered connection.
    ///
    /// Returns the number of connections reached; 0 when the server is idle.
    pub async fn broadcast(&self, message: ChatMessage) -> usize {
        let listening = self.listening.lock().await;
        match listening.as_ref() {
            Some(listening) => listening.shared.broadcast(&message).await,
            None => 0,
        }
    }

    /// Number of connections currently registered.
    pub async fn connected_clients(&self) -> usize {
        let listening = self.listening.lock().await;
        match listening.as_ref() {
            Some(listening) => listening.shared.registry.count().await,
            None => 0,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.listening.lock().await.is_some()
    }

    /// Address of the listening endpoint while the server is running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listening
            .lock()
            .await
            .as_ref()
            .map(|listening| listening.local_addr)
    }
}

/// Accept connections until shutdown is signalled.
///
/// Returns the set of handler tasks still running so `stop()` can wait for
/// them. Dropping the returned set (e.g. when the server is dropped without
/// `stop()`) aborts them.
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::warn!("Connection handler panicked: {}", e);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let (read_half, write_half) = stream.into_split();
                    let handler =
                        ConnectionHandler::register(read_half, write_half, peer, shared.clone())
                            .await;
                    if shared.announce_joins {
                        shared
                            .broadcast(&ChatMessage::system(format!(
                                "A new participant joined from {}",
                                peer
                            )))
                            .await;
                    }
                    handlers.spawn(handler.run());
                }
                Err(e) => {
                    if !shared.is_running() {
                        break;
                    }
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    tracing::debug!("Accept loop stopped");
    handlers
}
