//! Per-connection handler.
//!
//! Every accepted connection gets two tasks:
//!
//! - the **read loop** (`ConnectionHandler::run`), which decodes inbound
//!   messages and hands each one to the relay's broadcast, and
//! - the **writer task**, the only writer of the connection. It drains the
//!   queue the registry pushes into, so concurrent broadcasts never interleave
//!   bytes on the same socket.
//!
//! Teardown has a single exit path: whatever ended the read loop, the handler
//! unregisters itself (a no-op when `stop()` already drained it), lets the
//! writer flush what is queued and half-close, then drops the read half.

use std::{net::SocketAddr, sync::Arc};

use hiroba_shared::{ChatMessage, MessageReader, MessageWriter};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Notify, mpsc},
    task::JoinHandle,
};

use crate::{
    registry::{ConnectionEntry, ConnectionId},
    server::{SHUTDOWN_GRACE, ServerShared},
};

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    PeerClosed,
    DecodeFailed,
    ClosedByServer,
    ServerStopping,
}

impl CloseReason {
    fn describe(self) -> &'static str {
        match self {
            Self::PeerClosed => "closed by peer",
            Self::DecodeFailed => "undecodable data",
            Self::ClosedByServer => "closed by server",
            Self::ServerStopping => "server stopping",
        }
    }
}

pub(crate) struct ConnectionHandler<R> {
    id: ConnectionId,
    peer: SocketAddr,
    reader: MessageReader<R>,
    writer_task: JoinHandle<()>,
    close: Arc<Notify>,
    shared: Arc<ServerShared>,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Start the writer task and register the connection.
    ///
    /// The connection is visible to broadcasts once this returns.
    pub(crate) async fn register<W>(
        read_half: R,
        write_half: W,
        peer: SocketAddr,
        shared: Arc<ServerShared>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = shared.next_connection_id();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let close = Arc::new(Notify::new());

        let writer_task = tokio::spawn(writer_loop(
            id,
            MessageWriter::new(write_half),
            outbound_rx,
            close.clone(),
        ));

        shared
            .registry
            .add(ConnectionEntry::new(id, peer, outbound_tx, close.clone()))
            .await;
        tracing::info!("Client {} connected from {}", id, peer);

        Self {
            id,
            peer,
            reader: MessageReader::new(read_half),
            writer_task,
            close,
            shared,
        }
    }

    /// Run the read loop to completion, then tear the connection down.
    pub(crate) async fn run(mut self) {
        let reason = self.read_loop().await;
        self.teardown(reason).await;
    }

    async fn read_loop(&mut self) -> CloseReason {
        loop {
            let decoded = tokio::select! {
                _ = self.close.notified() => return CloseReason::ClosedByServer,
                decoded = self.reader.decode() => decoded,
            };

            match decoded {
                Ok(Some(message)) => {
                    if !self.shared.is_running() {
                        return CloseReason::ServerStopping;
                    }
                    tracing::debug!(
                        "Received message from '{}' on {}: {}",
                        message.sender,
                        self.id,
                        message.body
                    );
                    // 送信者自身を含む全員へ配送する
                    self.shared.broadcast(&message).await;
                }
                Ok(None) => return CloseReason::PeerClosed,
                Err(e) => {
                    tracing::warn!("Failed to decode message from {}: {}", self.peer, e);
                    return CloseReason::DecodeFailed;
                }
            }
        }
    }

    async fn teardown(&mut self, reason: CloseReason) {
        let removed = self.shared.registry.remove(self.id).await;

        // The writer ends once the registry's queue sender is gone, unless
        // the peer stopped reading and the transport is full.
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.writer_task).await {
            Ok(Err(e)) if !e.is_cancelled() => {
                tracing::warn!("Writer task for {} failed: {}", self.id, e);
            }
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(
                    "Writer for {} did not flush within {:?}; dropping queued messages",
                    self.id,
                    SHUTDOWN_GRACE
                );
                self.writer_task.abort();
            }
        }

        tracing::info!(
            "Client {} ({}) disconnected: {}{}",
            self.id,
            self.peer,
            reason.describe(),
            if removed { "" } else { " (already unregistered)" }
        );
    }
}

impl<R> Drop for ConnectionHandler<R> {
    fn drop(&mut self) {
        // No-op after a normal teardown; stops a writer stuck on a peer that
        // never reads when the handler itself is aborted.
        self.writer_task.abort();
    }
}

async fn writer_loop<W>(
    id: ConnectionId,
    mut writer: MessageWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<ChatMessage>,
    close: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        if let Err(e) = writer.write_message(&message).await {
            tracing::warn!("Failed to write to {}: {}", id, e);
            // Wake the read loop so the connection is torn down.
            close.notify_one();
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Failed to shut down write side of {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type PeerReader = MessageReader<ReadHalf<DuplexStream>>;
    type PeerWriter = MessageWriter<WriteHalf<DuplexStream>>;

    async fn connect_test_peer(
        shared: &Arc<ServerShared>,
        port: u16,
    ) -> (
        PeerReader,
        PeerWriter,
        ConnectionHandler<ReadHalf<DuplexStream>>,
    ) {
        let (server_side, peer_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (peer_read, peer_write) = tokio::io::split(peer_side);
        let peer: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let handler =
            ConnectionHandler::register(server_read, server_write, peer, shared.clone()).await;

        (
            MessageReader::new(peer_read),
            MessageWriter::new(peer_write),
            handler,
        )
    }

    #[tokio::test]
    async fn test_register_adds_connection_to_registry() {
        // テスト項目: ハンドラ作成時に Registry へ登録される
        // given (前提条件):
        let shared = Arc::new(ServerShared::new(false));

        // when (操作):
        let (_reader, _writer, _handler) = connect_test_peer(&shared, 50001).await;

        // then (期待する結果):
        assert_eq!(shared.registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_message_is_echoed_to_sender_and_others() {
        // テスト項目: 受信したメッセージが送信者自身を含む全接続に配送される
        // given (前提条件):
        let shared = Arc::new(ServerShared::new(false));
        let (mut alice_reader, mut alice_writer, alice) = connect_test_peer(&shared, 50001).await;
        let (mut bob_reader, _bob_writer, bob) = connect_test_peer(&shared, 50002).await;
        tokio::spawn(alice.run());
        tokio::spawn(bob.run());
        let message = ChatMessage::new("alice", "hi");

        // when (操作):
        alice_writer.write_message(&message).await.unwrap();

        // then (期待する結果):
        assert_eq!(alice_reader.decode().await.unwrap(), Some(message.clone()));
        assert_eq!(bob_reader.decode().await.unwrap(), Some(message));
    }

    #[tokio::test]
    async fn test_peer_close_unregisters_and_closes_write_side() {
        // テスト項目: 相手が切断するとハンドラは Registry から外れ、書き込み側も閉じる
        // given (前提条件):
        let shared = Arc::new(ServerShared::new(false));
        let (mut reader, mut writer, handler) = connect_test_peer(&shared, 50001).await;
        let task = tokio::spawn(handler.run());

        // when (操作):
        writer.shutdown().await.unwrap();
        task.await.unwrap();

        // then (期待する結果):
        assert_eq!(shared.registry.count().await, 0);
        assert!(reader.decode().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_input_ends_only_that_connection() {
        // テスト項目: 不正なデータを送った接続だけが閉じられ、他の接続は残る
        // given (前提条件):
        use tokio::io::AsyncWriteExt;

        let shared = Arc::new(ServerShared::new(false));
        let (server_side, mut bad_peer) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let peer: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let bad = ConnectionHandler::register(server_read, server_write, peer, shared.clone()).await;
        let (_good_reader, _good_writer, good) = connect_test_peer(&shared, 50002).await;
        let bad_task = tokio::spawn(bad.run());
        tokio::spawn(good.run());

        // when (操作):
        bad_peer.write_all(b"{not json}\n").await.unwrap();
        bad_task.await.unwrap();

        // then (期待する結果):
        assert_eq!(shared.registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_close_signal_flushes_queued_messages_before_eof() {
        // テスト項目: close 通知の前にキューへ積まれた通知は、切断前に書き出される
        // given (前提条件):
        let shared = Arc::new(ServerShared::new(false));
        let (mut reader, _writer, handler) = connect_test_peer(&shared, 50001).await;
        let task = tokio::spawn(handler.run());
        let notice = ChatMessage::system("Server is shutting down");

        // when (操作):
        shared.broadcast(&notice).await;
        for entry in shared.registry.drain().await {
            entry.close();
        }
        task.await.unwrap();

        // then (期待する結果):
        assert_eq!(reader.decode().await.unwrap(), Some(notice));
        assert!(reader.decode().await.unwrap().is_none());
        assert_eq!(shared.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_teardown_gives_up_on_writer_when_peer_stops_reading() {
        // テスト項目: 相手が書き込み側だけ閉じて読まない場合でも、猶予時間後にハンドラは終了する
        // given (前提条件): 小さなバッファを大きなメッセージで埋める
        use std::time::Duration;
        use tokio::io::AsyncWriteExt;

        let shared = Arc::new(ServerShared::new(false));
        let (server_side, peer_side) = tokio::io::duplex(64);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (_peer_read, mut peer_write) = tokio::io::split(peer_side);
        let peer: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let handler =
            ConnectionHandler::register(server_read, server_write, peer, shared.clone()).await;
        let task = tokio::spawn(handler.run());
        shared
            .broadcast(&ChatMessage::new("alice", &"x".repeat(10_000)))
            .await;

        // when (操作):
        peer_write.shutdown().await.unwrap();

        // then (期待する結果):
        tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(3), task)
            .await
            .expect("handler stayed alive behind a stuck writer")
            .unwrap();
        assert_eq!(shared.registry.count().await, 0);
    }
}
