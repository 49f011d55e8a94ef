//! Relay client connection.
//!
//! `Disconnected → Connected → Disconnected`: a value returned by
//! [`RelayClient::connect`] starts connected; once it disconnects (explicitly
//! or because the relay went away) it stays disconnected, and a new
//! `connect()` starts a new cycle.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use hiroba_shared::{ChatMessage, MessageReader, MessageWriter};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{Mutex, Notify, watch},
};

use crate::{error::ClientError, listener::MessageListener};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ClientInner {
    running: AtomicBool,
    /// Write path; the mutex keeps at most one send in flight.
    writer: Mutex<Option<MessageWriter<BoxedWriter>>>,
    /// Set once a disconnect starts; in-flight sends give up the writer.
    closing: watch::Sender<bool>,
    close: Notify,
    done: watch::Sender<bool>,
}

impl ClientInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        // Flip the flag first so a racing receive loop treats the closure
        // as expected.
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.closing.send_replace(true);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            tracing::debug!("Failed to shut down connection: {}", e);
        }

        self.close.notify_one();

        if was_running {
            tracing::info!("Disconnected from relay");
        }
    }
}

/// Connection to a relay server.
///
/// Dropping the client disconnects it.
pub struct RelayClient {
    inner: Arc<ClientInner>,
    done_rx: watch::Receiver<bool>,
    local_addr: Option<SocketAddr>,
}

impl RelayClient {
    /// Connect to the relay at `host:port` and start delivering messages to
    /// `listener`.
    ///
    /// # Errors
    ///
    /// * `ClientError::Connect` - the relay is unreachable or refused the
    ///   connection
    pub async fn connect<L>(host: &str, port: u16, listener: L) -> Result<Self, ClientError>
    where
        L: MessageListener,
    {
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = stream.local_addr().ok();
        tracing::info!("Connected to relay at {}", addr);

        let (read_half, write_half) = stream.into_split();
        let mut client = Self::from_halves(read_half, write_half, Arc::new(listener));
        client.local_addr = local_addr;
        Ok(client)
    }

    /// Build a connected client over an already established transport.
    pub(crate) fn from_halves<R, W>(
        read_half: R,
        write_half: W,
        listener: Arc<dyn MessageListener>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (done_tx, done_rx) = watch::channel(false);
        let writer: BoxedWriter = Box::new(write_half);
        let inner = Arc::new(ClientInner {
            running: AtomicBool::new(true),
            writer: Mutex::new(Some(MessageWriter::new(writer))),
            closing: watch::channel(false).0,
            close: Notify::new(),
            done: done_tx,
        });

        tokio::spawn(receive_loop(
            MessageReader::new(read_half),
            listener,
            inner.clone(),
        ));

        Self {
            inner,
            done_rx,
            local_addr: None,
        }
    }

    /// Send `ChatMessage { sender, body }` to the relay.
    ///
    /// Success only means the bytes were handed to the transport.
    ///
    /// # Errors
    ///
    /// * `ClientError::NotConnected` - the client has disconnected
    /// * `ClientError::Write` - the transport write failed
    pub async fn send_message(&self, sender: &str, body: &str) -> Result<(), ClientError> {
        if !self.inner.is_running() {
            return Err(ClientError::NotConnected);
        }

        let message = ChatMessage::new(sender, body);
        let mut closing = self.inner.closing.subscribe();
        // A send stuck on a full transport must not hold the writer while a
        // disconnect waits for it.
        tokio::select! {
            _ = closing.wait_for(|closing| *closing) => Err(ClientError::NotConnected),
            result = async {
                let mut writer = self.inner.writer.lock().await;
                let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
                writer
                    .write_message(&message)
                    .await
                    .map_err(ClientError::Write)
            } => result,
        }
    }

    /// Close the connection. Safe to call any number of times.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_running()
    }

    /// Wait until the receive loop has ended and the listener has been
    /// released.
    pub async fn closed(&self) {
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Local address of the connection, when connected over TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        // The receive loop runs the actual disconnect once woken.
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.closing.send_replace(true);
        self.inner.close.notify_one();
    }
}

async fn receive_loop<R>(
    mut reader: MessageReader<R>,
    listener: Arc<dyn MessageListener>,
    inner: Arc<ClientInner>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let decoded = tokio::select! {
            _ = inner.close.notified() => break,
            decoded = reader.decode() => decoded,
        };

        match decoded {
            Ok(Some(message)) => {
                if !inner.is_running() {
                    break;
                }
                listener.on_message(message);
            }
            Ok(None) => {
                tracing::debug!("Relay closed the connection");
                break;
            }
            Err(e) => {
                if inner.is_running() {
                    tracing::warn!("Failed to receive message: {}", e);
                }
                break;
            }
        }
    }

    inner.disconnect().await;
    drop(reader);
    drop(listener);
    inner.done.send_replace(true);
}
