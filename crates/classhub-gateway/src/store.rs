use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use anyhow::Context;
use tracing::{error, info, warn};
use uuid::Uuid;

use classhub_types::models::{ChatMessage, Identity, RoomId, Stroke};

use crate::error::StoreError;
use crate::oracle::{HistoryRecord, HistorySink};

/// How hard to push a mutation into the history sink before giving up on it.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before retry `n` is `backoff * n`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Chat log and whiteboard pages of one room.
#[derive(Debug, Default)]
pub struct RoomState {
    chat: Vec<ChatMessage>,
    /// Sparse: a page exists once something drew on it or cleared it
    pages: BTreeMap<u32, Vec<Stroke>>,
}

impl RoomState {
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.chat.clone()
    }

    /// Pages `0..=max_known_index`, with empty pages filling the gaps.
    pub fn snapshot(&self) -> Vec<Vec<Stroke>> {
        let Some((&max_index, _)) = self.pages.last_key_value() else {
            return Vec::new();
        };

        (0..=max_index)
            .map(|index| self.pages.get(&index).cloned().unwrap_or_default())
            .collect()
    }

    fn push_stroke(&mut self, page_index: u32, stroke: Stroke) {
        self.pages.entry(page_index).or_default().push(stroke);
    }

    fn clear_page(&mut self, page_index: u32) {
        self.pages.insert(page_index, Vec::new());
    }
}

/// Per-room chat and whiteboard state, written through to a [`HistorySink`].
///
/// Each room sits behind its own mutex; holding a [`RoomGuard`] serializes
/// every mutation and broadcast for that room while other rooms proceed.
#[derive(Clone)]
pub struct RoomStateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<RoomState>>>>,
    sink: Arc<dyn HistorySink>,
    retry: RetryPolicy,
}

impl RoomStateStore {
    pub fn new(sink: Arc<dyn HistorySink>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                rooms: RwLock::new(HashMap::new()),
                sink,
                retry,
            }),
        }
    }

    /// Rebuild in-memory rooms from the sink. Call once at startup, before
    /// any connection is accepted. Returns the number of rooms restored.
    pub async fn rehydrate(&self) -> anyhow::Result<usize> {
        let sink = self.inner.sink.clone();
        let history = tokio::task::spawn_blocking(move || sink.load())
            .await
            .context("history load task")??;
        let mut restored: HashMap<RoomId, RoomState> = HashMap::new();

        for message in history.messages {
            restored
                .entry(message.room_id.clone())
                .or_default()
                .chat
                .push(message);
        }
        for (room_id, page_index) in history.pages {
            restored
                .entry(room_id)
                .or_default()
                .pages
                .entry(page_index)
                .or_default();
        }
        for (room_id, page_index, stroke) in history.strokes {
            restored.entry(room_id).or_default().push_stroke(page_index, stroke);
        }

        let count = restored.len();
        let mut rooms = self.inner.rooms.write().await;
        for (room_id, state) in restored {
            rooms.insert(room_id, Arc::new(Mutex::new(state)));
        }

        info!("Rehydrated {} rooms from history", count);
        Ok(count)
    }

    /// Exclusive access to a room, creating it on first use.
    pub async fn lock(&self, room_id: &str) -> RoomGuard {
        let cell = {
            let rooms = self.inner.rooms.read().await;
            rooms.get(room_id).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => self
                .inner
                .rooms
                .write()
                .await
                .entry(room_id.to_string())
                .or_default()
                .clone(),
        };

        RoomGuard {
            room_id: room_id.to_string(),
            state: cell.lock_owned().await,
            store: self.clone(),
        }
    }

    pub async fn append_chat(
        &self,
        room_id: &str,
        author: &Identity,
        text: String,
    ) -> Result<ChatMessage, StoreError> {
        self.lock(room_id).await.append_chat(author, text).await
    }

    pub async fn read_chat_history(&self, room_id: &str) -> Vec<ChatMessage> {
        self.lock(room_id).await.chat_history()
    }

    pub async fn append_stroke(
        &self,
        room_id: &str,
        page_index: u32,
        stroke: Stroke,
    ) -> Result<(), StoreError> {
        self.lock(room_id).await.append_stroke(page_index, stroke).await
    }

    pub async fn clear_page(&self, room_id: &str, page_index: u32) -> Result<(), StoreError> {
        self.lock(room_id).await.clear_page(page_index).await
    }

    pub async fn snapshot(&self, room_id: &str) -> Vec<Vec<Stroke>> {
        self.lock(room_id).await.snapshot()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    async fn write_through(&self, room_id: &str, record: HistoryRecord) -> Result<(), StoreError> {
        let retry = self.inner.retry;
        let attempts = retry.attempts.max(1);
        let what = record.kind();
        let record = Arc::new(record);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let sink = self.inner.sink.clone();
            let pending = record.clone();
            let outcome = match tokio::task::spawn_blocking(move || sink.persist(&pending)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("spawn_blocking join error: {}", e);
                    Err(anyhow::anyhow!("history sink task failed: {}", e))
                }
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "History sink failed to store {} for room {} (attempt {}/{}): {}",
                        what, room_id, attempt, attempts, e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(retry.backoff * attempt).await;
                    }
                }
            }
        }

        Err(StoreError::Unavailable {
            room_id: room_id.to_string(),
            what,
            attempts,
            last_error,
        })
    }
}

/// A locked room. Mutations are persisted first and applied in memory only
/// once the sink accepts them.
pub struct RoomGuard {
    room_id: RoomId,
    state: OwnedMutexGuard<RoomState>,
    store: RoomStateStore,
}

impl RoomGuard {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Append a chat line and return it with its assigned timestamp.
    /// Timestamps never go backwards within a room.
    pub async fn append_chat(&mut self, author: &Identity, text: String) -> Result<ChatMessage, StoreError> {
        let now = Utc::now();
        let timestamp = match self.state.chat.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };

        let message = ChatMessage {
            id: Uuid::new_v4(),
            room_id: self.room_id.clone(),
            user_id: author.user_id,
            username: author.username.clone(),
            role: author.role,
            text,
            timestamp,
        };

        self.store
            .write_through(&self.room_id, HistoryRecord::Chat(message.clone()))
            .await?;
        self.state.chat.push(message.clone());
        Ok(message)
    }

    pub async fn append_stroke(&mut self, page_index: u32, stroke: Stroke) -> Result<(), StoreError> {
        self.store
            .write_through(
                &self.room_id,
                HistoryRecord::Stroke {
                    room_id: self.room_id.clone(),
                    page_index,
                    stroke: stroke.clone(),
                },
            )
            .await?;
        self.state.push_stroke(page_index, stroke);
        Ok(())
    }

    pub async fn clear_page(&mut self, page_index: u32) -> Result<(), StoreError> {
        self.store
            .write_through(
                &self.room_id,
                HistoryRecord::Clear {
                    room_id: self.room_id.clone(),
                    page_index,
                },
            )
            .await?;
        self.state.clear_page(page_index);
        Ok(())
    }

    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.state.chat_history()
    }

    pub fn snapshot(&self) -> Vec<Vec<Stroke>> {
        self.state.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{MemorySink, StoredHistory};
    use classhub_types::models::Role;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` writes, then accepts everything.
    struct FlakySink {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl HistorySink for FlakySink {
        fn persist(&self, _record: &HistoryRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("disk unavailable");
            }
            Ok(())
        }

        fn load(&self) -> anyhow::Result<StoredHistory> {
            Ok(StoredHistory::default())
        }
    }

    /// Holds chat writes for room "slow" until the test opens the gate.
    struct GatedSink {
        entered: tokio::sync::mpsc::UnboundedSender<()>,
        gate: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl HistorySink for GatedSink {
        fn persist(&self, record: &HistoryRecord) -> anyhow::Result<()> {
            if matches!(record, HistoryRecord::Chat(message) if message.room_id == "slow") {
                let _ = self.entered.send(());
                let gate = self.gate.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
                gate.recv()?;
            }
            Ok(())
        }

        fn load(&self) -> anyhow::Result<StoredHistory> {
            Ok(StoredHistory::default())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn author() -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            role: Role::User,
        }
    }

    #[tokio::test]
    async fn test_snapshot_densifies_sparse_pages() {
        let store = RoomStateStore::new(Arc::new(MemorySink::new()), fast_retry());
        store.append_stroke("r1", 3, json!("s3")).await.unwrap();
        store.append_stroke("r1", 1, json!("s1a")).await.unwrap();
        store.append_stroke("r1", 1, json!("s1b")).await.unwrap();

        let pages = store.snapshot("r1").await;
        assert_eq!(
            pages,
            vec![vec![], vec![json!("s1a"), json!("s1b")], vec![], vec![json!("s3")]]
        );
        assert!(store.snapshot("untouched").await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_creates_missing_page() {
        let store = RoomStateStore::new(Arc::new(MemorySink::new()), fast_retry());
        store.append_stroke("r1", 0, json!("s1")).await.unwrap();
        store.clear_page("r1", 0).await.unwrap();
        store.clear_page("r1", 2).await.unwrap();

        assert_eq!(store.snapshot("r1").await, vec![Vec::<Stroke>::new(); 3]);
    }

    #[tokio::test]
    async fn test_chat_timestamps_never_decrease() {
        let store = RoomStateStore::new(Arc::new(MemorySink::new()), fast_retry());
        let who = author();
        for i in 0..20 {
            store.append_chat("r1", &who, format!("line {}", i)).await.unwrap();
        }

        let history = store.read_chat_history("r1").await;
        assert_eq!(history.len(), 20);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(history[0].text, "line 0");
        assert_eq!(history[19].text, "line 19");
    }

    #[tokio::test]
    async fn test_write_through_retries_then_succeeds() {
        let sink = Arc::new(FlakySink::new(2));
        let store = RoomStateStore::new(sink.clone(), fast_retry());

        let message = store.append_chat("r1", &author(), "hello".into()).await.unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.read_chat_history("r1").await, vec![message]);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_applied() {
        let sink = Arc::new(FlakySink::new(10));
        let store = RoomStateStore::new(sink.clone(), fast_retry());

        let err = store.append_stroke("r1", 0, json!("s1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { attempts: 3, .. }));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert!(store.snapshot("r1").await.is_empty());
    }

    #[tokio::test]
    async fn test_rehydrate_restores_rooms() {
        let sink = Arc::new(MemorySink::new());
        let first = RoomStateStore::new(sink.clone(), fast_retry());
        let who = author();
        first.append_chat("r1", &who, "one".into()).await.unwrap();
        first.append_chat("r1", &who, "two".into()).await.unwrap();
        first.append_stroke("r1", 2, json!("s")).await.unwrap();
        first.clear_page("r2", 1).await.unwrap();

        let second = RoomStateStore::new(sink, fast_retry());
        assert_eq!(second.rehydrate().await.unwrap(), 2);

        assert_eq!(
            second.read_chat_history("r1").await,
            first.read_chat_history("r1").await
        );
        assert_eq!(second.snapshot("r1").await, vec![vec![], vec![], vec![json!("s")]]);
        assert_eq!(second.snapshot("r2").await, vec![Vec::<Stroke>::new(); 2]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_stalled_sink_write_does_not_block_other_rooms() {
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let (open_tx, open_rx) = std::sync::mpsc::channel();
        let sink = Arc::new(GatedSink {
            entered: entered_tx,
            gate: std::sync::Mutex::new(open_rx),
        });
        let store = RoomStateStore::new(sink, fast_retry());
        let who = author();

        let slow = {
            let store = store.clone();
            let who = who.clone();
            tokio::spawn(async move { store.append_chat("slow", &who, "held".into()).await })
        };
        entered_rx.recv().await.unwrap();

        // The only runtime thread is free while "slow" waits on its write
        store.append_chat("fast", &who, "through".into()).await.unwrap();
        assert_eq!(store.read_chat_history("fast").await.len(), 1);
        assert!(!slow.is_finished());

        open_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(store.read_chat_history("slow").await.len(), 1);
    }
}
