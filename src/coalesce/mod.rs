//! Write coalescing
//!
//! A user tapping "+1" ten times must not produce ten network writes. Each
//! session buffers its pending field edits per counter; a flusher task
//! waits out a quiet period (restarted on every new edit, debounce not
//! throttle) and then issues one merged partial update carrying every
//! buffered field plus the audit trail. The last value the user saw
//! locally is exactly what gets persisted.
//!
//! Buffers are scoped to the owning session and die with it; there is no
//! process-global state and no retry queue. A failed flush drops the
//! buffer and surfaces a sync-error event toward the UI.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::record::{CounterField, OwnerGuard, RecordPatch};
use crate::session::SessionEvent;
use crate::store::RecordStore;
use crate::types::Editor;

/// Edits waiting to be flushed for one counter. Last local value wins per
/// field; the newest edit also carries the freshest owner guard.
struct PendingBuffer {
    fields: HashMap<CounterField, u32>,
    deadline: Instant,
    guard: Option<OwnerGuard>,
}

struct Inner {
    buffers: HashMap<String, PendingBuffer>,
    tasks: HashMap<String, JoinHandle<()>>,
}

struct Shared {
    store: Arc<dyn RecordStore>,
    record_id: String,
    editor: Editor,
    inner: Mutex<Inner>,
    events: mpsc::Sender<SessionEvent>,
}

/// Session-scoped debounce layer between the controller and the store.
#[derive(Clone)]
pub struct WriteCoalescer {
    shared: Arc<Shared>,
    quiet: Duration,
}

impl WriteCoalescer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        record_id: impl Into<String>,
        editor: Editor,
        quiet: Duration,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                record_id: record_id.into(),
                editor,
                inner: Mutex::new(Inner {
                    buffers: HashMap::new(),
                    tasks: HashMap::new(),
                }),
                events,
            }),
            quiet,
        }
    }

    /// Merge one field edit into the counter's pending buffer and push the
    /// flush deadline out by the quiet period.
    pub async fn buffer(
        &self,
        counter_key: &str,
        field: CounterField,
        value: u32,
        guard: Option<OwnerGuard>,
    ) {
        let mut inner = self.shared.inner.lock().await;
        let deadline = Instant::now() + self.quiet;
        let buf = inner
            .buffers
            .entry(counter_key.to_string())
            .or_insert_with(|| PendingBuffer {
                fields: HashMap::new(),
                deadline,
                guard: None,
            });
        buf.fields.insert(field, value);
        buf.deadline = deadline;
        buf.guard = guard;

        let task_alive = inner.tasks.contains_key(counter_key);
        if !task_alive {
            let shared = Arc::clone(&self.shared);
            let key = counter_key.to_string();
            let handle = tokio::spawn(flush_loop(shared, key));
            inner.tasks.insert(counter_key.to_string(), handle);
        }
    }

    /// Number of counters with unflushed edits.
    pub async fn pending(&self) -> usize {
        self.shared.inner.lock().await.buffers.len()
    }

    /// Re-apply unflushed edits on top of an incoming snapshot, so a
    /// server update arriving mid-debounce doesn't wipe what the user
    /// just typed. Subset clamps run against the snapshot's totals, same
    /// as the eventual flush will at the store.
    pub async fn overlay(&self, record: &mut crate::record::EventRecord) {
        let inner = self.shared.inner.lock().await;
        for (key, buf) in &inner.buffers {
            if let Some(counter) = record.counts.get_mut(key) {
                for (field, value) in &buf.fields {
                    counter.set_field(*field, *value);
                }
                counter.clamp_subsets();
            }
        }
    }

    /// Tear the buffer arena down with the session. Pending edits are
    /// discarded, matching editor-unmount behavior.
    pub async fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().await;
        for (_, handle) in inner.tasks.drain() {
            handle.abort();
        }
        let dropped = inner.buffers.len();
        inner.buffers.clear();
        if dropped > 0 {
            debug!(
                record_id = %self.shared.record_id,
                dropped,
                "Coalescer shut down with unflushed buffers"
            );
        }
    }
}

/// One flusher per dirty counter: sleep until the deadline stops moving,
/// flush the merged patch, and exit once the buffer stays empty. The task
/// unregisters itself under the same lock that guards buffer insertion, so
/// an edit racing the exit either sees the live task or spawns a new one.
async fn flush_loop(shared: Arc<Shared>, key: String) {
    loop {
        let deadline = {
            let mut inner = shared.inner.lock().await;
            match inner.buffers.get(&key) {
                Some(buf) => buf.deadline,
                None => {
                    inner.tasks.remove(&key);
                    return;
                }
            }
        };

        tokio::time::sleep_until(deadline).await;

        let ready = {
            let mut inner = shared.inner.lock().await;
            match inner.buffers.get(&key) {
                Some(buf) if buf.deadline <= Instant::now() => inner.buffers.remove(&key),
                _ => None,
            }
        };

        let Some(buf) = ready else { continue };

        let mut patch = RecordPatch::new();
        for (field, value) in &buf.fields {
            patch = patch.set_field(&key, *field, *value);
        }
        patch = patch.audit(
            &key,
            shared.editor.id.as_str(),
            Utc::now().timestamp_millis(),
        );
        patch.guard = buf.guard;

        match shared
            .store
            .apply_patch(&shared.record_id, &shared.editor.id, patch)
            .await
        {
            Ok(()) => {
                debug!(
                    record_id = %shared.record_id,
                    counter = %key,
                    fields = buf.fields.len(),
                    "Flushed coalesced edits"
                );
            }
            Err(e) => {
                // No retry queue: the buffer is gone and the user re-enters
                // the lost edits after the next snapshot reverts them.
                warn!(
                    record_id = %shared.record_id,
                    counter = %key,
                    error = %e,
                    "Flush failed, dropping buffered edits"
                );
                let _ = shared
                    .events
                    .send(SessionEvent::SyncError {
                        counter_key: key.clone(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventPlan, InstrumentSpec};
    use crate::store::MemoryStore;
    use crate::types::Role;

    async fn setup() -> (Arc<MemoryStore>, WriteCoalescer, mpsc::Receiver<SessionEvent>) {
        let store = Arc::new(MemoryStore::new());
        let plan = EventPlan::new(vec![
            InstrumentSpec::new("violin", "strings"),
            InstrumentSpec::new("organ", "keys"),
        ]);
        store.create_record("ev-1", &plan).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let coalescer = WriteCoalescer::new(
            store.clone(),
            "ev-1",
            Editor::new("c-1", "Ana", Role::Counter),
            Duration::from_millis(600),
            tx,
        );
        (store, coalescer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_edits_flush_once_with_last_value() {
        let (store, coalescer, _rx) = setup().await;
        let me = crate::types::ClientId::from("c-1");

        for value in [5u32, 7, 3] {
            coalescer
                .buffer("violin", CounterField::Total, value, None)
                .await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(coalescer.pending().await, 1);

        tokio::time::sleep(Duration::from_millis(700)).await;

        let record = store.get_record("ev-1", &me).await.unwrap();
        let violin = record.counter("violin").unwrap();
        assert_eq!(violin.total, 3);
        assert_eq!(violin.last_editor_id.as_deref(), Some("c-1"));
        // Exactly one write reached the store.
        assert_eq!(record.revision, 1);
        assert_eq!(coalescer.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_edit_restarts_the_quiet_period() {
        let (store, coalescer, _rx) = setup().await;
        let me = crate::types::ClientId::from("c-1");

        coalescer
            .buffer("violin", CounterField::Total, 1, None)
            .await;
        // Keep poking before the window closes: nothing may flush.
        for value in 2..=4u32 {
            tokio::time::sleep(Duration::from_millis(400)).await;
            coalescer
                .buffer("violin", CounterField::Total, value, None)
                .await;
            assert_eq!(store.get_record("ev-1", &me).await.unwrap().revision, 0);
        }

        tokio::time::sleep(Duration::from_millis(700)).await;
        let record = store.get_record("ev-1", &me).await.unwrap();
        assert_eq!(record.counter("violin").unwrap().total, 4);
        assert_eq!(record.revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_counters_flush_independently() {
        let (store, coalescer, _rx) = setup().await;
        let me = crate::types::ClientId::from("c-1");

        coalescer
            .buffer("violin", CounterField::Total, 2, None)
            .await;
        coalescer.buffer("organ", CounterField::Total, 1, None).await;
        assert_eq!(coalescer.pending().await, 2);

        tokio::time::sleep(Duration::from_millis(700)).await;
        let record = store.get_record("ev-1", &me).await.unwrap();
        assert_eq!(record.counter("violin").unwrap().total, 2);
        assert_eq!(record.counter("organ").unwrap().total, 1);
        assert_eq!(record.revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merged_flush_carries_every_buffered_field() {
        let (store, coalescer, _rx) = setup().await;
        let me = crate::types::ClientId::from("c-1");

        coalescer
            .buffer("violin", CounterField::Total, 5, None)
            .await;
        coalescer
            .buffer("violin", CounterField::Local, 4, None)
            .await;
        coalescer
            .buffer("violin", CounterField::Leaders, 1, None)
            .await;

        tokio::time::sleep(Duration::from_millis(700)).await;
        let record = store.get_record("ev-1", &me).await.unwrap();
        let violin = record.counter("violin").unwrap();
        assert_eq!((violin.total, violin.local, violin.leaders), (5, 4, 1));
        assert_eq!(record.revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_drops_buffer_and_reports() {
        let (store, coalescer, mut rx) = setup().await;

        coalescer
            .buffer("violin", CounterField::Total, 2, None)
            .await;
        store.delete_record("ev-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        match rx.recv().await.unwrap() {
            SessionEvent::SyncError { counter_key, .. } => assert_eq!(counter_key, "violin"),
            other => panic!("expected SyncError, got {:?}", other),
        }
        assert_eq!(coalescer.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_flush_fails_after_owner_change() {
        let (store, coalescer, mut rx) = setup().await;
        let me = crate::types::ClientId::from("c-1");

        coalescer
            .buffer(
                "violin",
                CounterField::Total,
                2,
                Some(OwnerGuard {
                    section: "strings".into(),
                    expected_owner: Some("c-1".into()),
                }),
            )
            .await;

        // Someone else grabs the section before the flush lands.
        let grant = RecordPatch::new().grant_section("strings", "c-2", "Bea", 1000);
        store.apply_patch("ev-1", &me, grant).await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::SyncError { .. }
        ));
        let record = store.get_record("ev-1", &me).await.unwrap();
        assert_eq!(record.counter("violin").unwrap().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_pending_edits() {
        let (store, coalescer, _rx) = setup().await;
        let me = crate::types::ClientId::from("c-1");

        coalescer
            .buffer("violin", CounterField::Total, 9, None)
            .await;
        coalescer.shutdown().await;

        tokio::time::sleep(Duration::from_millis(700)).await;
        let record = store.get_record("ev-1", &me).await.unwrap();
        assert_eq!(record.counter("violin").unwrap().total, 0);
        assert_eq!(record.revision, 0);
    }
}
