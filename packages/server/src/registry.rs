//! Connection registry.
//!
//! ## 責務
//!
//! - 接続中のコネクションの登録・削除
//! - 登録済みの全コネクションへのブロードキャスト
//!
//! ## 設計ノート
//!
//! 各コネクションへの書き込みは `handler` の writer タスクが一手に担います。
//! Registry が保持するのはその writer へのキュー (`UnboundedSender`) だけなので、
//! ブロードキャストはロックを保持したままキューへ積むだけで完了し、
//! ネットワーク I/O を待つことはありません。ロック内で積むことで、
//! リレーが受信した順序がそのまま全コネクションへの配送順序になります。

use std::{collections::BTreeMap, fmt, net::SocketAddr, sync::Arc};

use hiroba_shared::ChatMessage;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::PushError;

/// Identifier of one accepted connection, unique within a server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live server-side connection as seen by the registry.
///
/// The entry only references the connection: the transport itself is owned
/// by its handler. Dropping the entry drops the queue sender, which lets the
/// writer task finish once everything queued has been flushed.
#[derive(Debug)]
pub struct ConnectionEntry {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<ChatMessage>,
    close: Arc<Notify>,
}

impl ConnectionEntry {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<ChatMessage>,
        close: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            peer,
            outbound,
            close,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a message for this connection's writer.
    pub fn send(&self, message: ChatMessage) -> Result<(), PushError> {
        self.outbound
            .send(message)
            .map_err(|_| PushError::Closed(self.id))
    }

    /// Ask the handler to close the connection.
    ///
    /// Messages queued before this call are still written before the write
    /// side is shut down.
    pub fn close(self) {
        self.close.notify_one();
    }
}

/// Concurrency-safe collection of live connections.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<BTreeMap<ConnectionId, ConnectionEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. It receives every broadcast issued after this
    /// returns.
    pub async fn add(&self, entry: ConnectionEntry) {
        let mut entries = self.entries.lock().await;
        let id = entry.id();
        tracing::debug!("Connection {} ({}) registered", id, entry.peer());
        entries.insert(id, entry);
    }

    /// Unregister a connection.
    ///
    /// Removing an absent entry is a no-op; the return value tells whether
    /// this call was the one that removed it.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.remove(&id) {
            Some(entry) => {
                tracing::debug!("Connection {} ({}) unregistered", id, entry.peer());
                true
            }
            None => false,
        }
    }

    /// Queue `message` for every connection registered at this instant.
    ///
    /// A failure on one connection is logged and skipped. Returns the number
    /// of connections the message was handed to.
    pub async fn broadcast(&self, message: &ChatMessage) -> usize {
        let entries = self.entries.lock().await;

        let mut delivered = 0;
        for entry in entries.values() {
            match entry.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    // ブロードキャストでは一部の送信失敗を許容
                    tracing::warn!("Failed to push message to {}: {}", entry.peer(), e);
                }
            }
        }

        tracing::debug!(
            "Broadcasted message from '{}' to {}/{} connections",
            message.sender,
            delivered,
            entries.len()
        );
        delivered
    }

    /// Number of currently registered connections.
    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Remove every entry at once and hand them to the caller.
    pub async fn drain(&self) -> Vec<ConnectionEntry> {
        let mut entries = self.entries.lock().await;
        std::mem::take(&mut *entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================
    // テスト作業記録
    // ========================================
    // 【何をテストするか】
    // - Registry の add / remove / broadcast / count / drain
    //
    // 【なぜこのテストが必要か】
    // - 接続数は Registry の件数から導出されるため、件数が常に正しい必要がある
    // - remove は handler と stop() の双方から呼ばれるため冪等でなければならない
    // - broadcast は一部の失敗で残りへの配送を止めてはならない
    // ========================================

    struct TestConnection {
        entry: ConnectionEntry,
        rx: mpsc::UnboundedReceiver<ChatMessage>,
        close: Arc<Notify>,
    }

    fn create_test_connection(id: u64) -> TestConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let close = Arc::new(Notify::new());
        let peer: SocketAddr = format!("127.0.0.1:{}", 40000 + id).parse().unwrap();
        let entry = ConnectionEntry::new(ConnectionId::new(id), peer, tx, close.clone());
        TestConnection { entry, rx, close }
    }

    #[tokio::test]
    async fn test_add_increments_count() {
        // テスト項目: 登録した件数が count に反映される
        // given (前提条件):
        let registry = Registry::new();
        let alice = create_test_connection(1);
        let bob = create_test_connection(2);

        // when (操作):
        registry.add(alice.entry).await;
        registry.add(bob.entry).await;

        // then (期待する結果):
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        // テスト項目: 同じエントリを 2 回削除しても 1 回分しか減らない
        // given (前提条件):
        let registry = Registry::new();
        let alice = create_test_connection(1);
        let bob = create_test_connection(2);
        registry.add(alice.entry).await;
        registry.add(bob.entry).await;

        // when (操作):
        let first = registry.remove(ConnectionId::new(1)).await;
        let second = registry.remove(ConnectionId::new(1)).await;

        // then (期待する結果):
        assert!(first);
        assert!(!second);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_entry_is_noop() {
        // テスト項目: 未登録のエントリの削除はエラーにならず件数も変わらない
        // given (前提条件):
        let registry = Registry::new();

        // when (操作):
        let removed = registry.remove(ConnectionId::new(42)).await;

        // then (期待する結果):
        assert!(!removed);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_entry_once() {
        // テスト項目: 登録済みの全エントリにちょうど 1 回ずつ配送される
        // given (前提条件):
        let registry = Registry::new();
        let mut alice = create_test_connection(1);
        let mut bob = create_test_connection(2);
        registry.add(alice.entry).await;
        registry.add(bob.entry).await;
        let message = ChatMessage::new("alice", "hi");

        // when (操作):
        let delivered = registry.broadcast(&message).await;

        // then (期待する結果):
        assert_eq!(delivered, 2);
        assert_eq!(alice.rx.recv().await, Some(message.clone()));
        assert_eq!(bob.rx.recv().await, Some(message));
        assert!(alice.rx.try_recv().is_err());
        assert!(bob.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failed_entry() {
        // テスト項目: writer が停止したエントリがあっても他のエントリには配送される
        // given (前提条件):
        let registry = Registry::new();
        let alice = create_test_connection(1);
        let mut bob = create_test_connection(2);
        registry.add(alice.entry).await;
        registry.add(bob.entry).await;
        drop(alice.rx);
        let message = ChatMessage::new("bob", "still here?");

        // when (操作):
        let delivered = registry.broadcast(&message).await;

        // then (期待する結果):
        assert_eq!(delivered, 1);
        assert_eq!(bob.rx.recv().await, Some(message));
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_per_entry() {
        // テスト項目: 連続したブロードキャストは同じ順序で各エントリに届く
        // given (前提条件):
        let registry = Registry::new();
        let mut alice = create_test_connection(1);
        registry.add(alice.entry).await;

        // when (操作):
        for i in 0..10 {
            registry
                .broadcast(&ChatMessage::new("bob", i.to_string()))
                .await;
        }

        // then (期待する結果):
        for i in 0..10 {
            let received = alice.rx.recv().await.unwrap();
            assert_eq!(received.body, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_removed_entry_no_longer_receives_broadcast() {
        // テスト項目: 削除後のエントリにはブロードキャストが届かず、キューも閉じる
        // given (前提条件):
        let registry = Registry::new();
        let mut alice = create_test_connection(1);
        let mut bob = create_test_connection(2);
        registry.add(alice.entry).await;
        registry.add(bob.entry).await;
        registry.remove(ConnectionId::new(2)).await;
        let message = ChatMessage::new("alice", "only me");

        // when (操作):
        let delivered = registry.broadcast(&message).await;

        // then (期待する結果):
        assert_eq!(delivered, 1);
        assert_eq!(alice.rx.recv().await, Some(message));
        assert_eq!(bob.rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_drain_empties_registry_and_close_notifies_handler() {
        // テスト項目: drain で全エントリが取り出され、close でハンドラに通知される
        // given (前提条件):
        let registry = Registry::new();
        let alice = create_test_connection(1);
        let bob = create_test_connection(2);
        let alice_close = alice.close.clone();
        let bob_close = bob.close.clone();
        registry.add(alice.entry).await;
        registry.add(bob.entry).await;

        // when (操作):
        let drained = registry.drain().await;
        for entry in drained {
            entry.close();
        }

        // then (期待する結果):
        assert_eq!(registry.count().await, 0);
        // notify_one はパーミットを保持するので、後から待っても即座に完了する
        alice_close.notified().await;
        bob_close.notified().await;
    }

    #[tokio::test]
    async fn test_concurrent_add_and_remove_reaches_zero() {
        // テスト項目: 並行に add / remove しても件数は負にならず最終的に 0 になる
        // given (前提条件):
        let registry = Arc::new(Registry::new());
        let mut receivers = Vec::new();
        let mut tasks = Vec::new();

        // when (操作):
        for id in 0..32 {
            let connection = create_test_connection(id);
            receivers.push(connection.rx);
            let registry = registry.clone();
            let entry = connection.entry;
            tasks.push(tokio::spawn(async move {
                registry.add(entry).await;
                registry
                    .broadcast(&ChatMessage::new("load", id.to_string()))
                    .await;
                // handler の終了処理と stop() の競合を模擬
                let first = registry.remove(ConnectionId::new(id)).await;
                let second = registry.remove(ConnectionId::new(id)).await;
                (first, second)
            }));
        }

        // then (期待する結果):
        for task in tasks {
            let (first, second) = task.await.unwrap();
            assert!(first);
            assert!(!second);
        }
        assert_eq!(registry.count().await, 0);
    }
}
