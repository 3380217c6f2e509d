//! Counter session - the per-editor controller over one event record
//!
//! A session subscribes to the shared record, keeps an optimistic local
//! copy in sync with store snapshots, routes user intents (+1, -1, direct
//! entry) through validation and the coalescer, and manages claims and
//! heartbeats for the sections this editor owns. Revoked access tears the
//! session down quietly; no error here is fatal to the surrounding page.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::claim::{ClaimManager, ClaimOutcome};
use crate::coalesce::WriteCoalescer;
use crate::config::CoreConfig;
use crate::heartbeat::Heartbeat;
use crate::record::{CounterField, EventRecord, OwnerGuard, SectionTotals};
use crate::store::{RecordStore, StoreEvent};
use crate::types::{ClientId, Editor, PodiumError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What the UI hears from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A fresh snapshot landed; re-render counters and ownership tags.
    Updated,
    /// A flush was lost; show a transient sync-error toast. The next
    /// snapshot reverts the optimistic values.
    SyncError { counter_key: String, message: String },
    /// Access was withdrawn mid-session; return to an empty state quietly.
    AccessRevoked,
    /// The event record was deleted as a unit.
    Deleted,
}

/// One editor's live view onto one event record.
pub struct CounterSession {
    store: Arc<dyn RecordStore>,
    record_id: String,
    editor: Editor,
    state: Arc<RwLock<EventRecord>>,
    claims: ClaimManager,
    coalescer: WriteCoalescer,
    heartbeats: Mutex<HashMap<String, Heartbeat>>,
    config: CoreConfig,
    snapshot_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl CounterSession {
    /// Subscribe to a record and start the snapshot loop. Returns the
    /// session plus the event feed the UI consumes.
    pub async fn open(
        store: Arc<dyn RecordStore>,
        config: CoreConfig,
        record_id: impl Into<String>,
        editor: Editor,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let record_id = record_id.into();
        let (initial, store_rx) = store.subscribe(&record_id, &editor.id).await?;
        let state = Arc::new(RwLock::new(initial));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let coalescer = WriteCoalescer::new(
            Arc::clone(&store),
            record_id.clone(),
            editor.clone(),
            config.flush_quiet_period(),
            events_tx.clone(),
        );
        let snapshot_task = tokio::spawn(snapshot_loop(
            store_rx,
            Arc::clone(&state),
            events_tx,
            Arc::clone(&store),
            coalescer.clone(),
            record_id.clone(),
            editor.id.clone(),
        ));
        let claims = ClaimManager::new(Arc::clone(&store), config.clone());

        debug!(record_id, editor = %editor.id, "Opened counter session");
        Ok((
            Self {
                store,
                record_id,
                editor,
                state,
                claims,
                coalescer,
                heartbeats: Mutex::new(HashMap::new()),
                config,
                snapshot_task,
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn editor(&self) -> &Editor {
        &self.editor
    }

    /// Current local snapshot (optimistic edits included).
    pub async fn snapshot(&self) -> EventRecord {
        self.state.read().await.clone()
    }

    /// Whether this editor may edit counters of the section right now:
    /// administrators always, otherwise only while the section is free or
    /// held by this editor. An inactive foreign owner still blocks edits -
    /// it only unlocks the takeover path, not the counters.
    pub async fn can_edit(&self, section: &str) -> bool {
        if self.editor.is_admin() {
            return true;
        }
        let state = self.state.read().await;
        match state.section_meta(section).map(|meta| &meta.owner_id) {
            Some(None) => true,
            Some(Some(owner)) => owner == self.editor.id.as_str(),
            None => false,
        }
    }

    /// Claim a section; on a grant, start its heartbeat.
    pub async fn claim_section(&self, section: &str) -> Result<ClaimOutcome> {
        let outcome = self.claims.claim(&self.record_id, section, &self.editor).await?;
        if outcome == ClaimOutcome::Granted {
            self.ensure_heartbeat(section).await;
        }
        Ok(outcome)
    }

    /// Take over a stale section after the user confirmed.
    pub async fn confirm_takeover(&self, section: &str) -> Result<ClaimOutcome> {
        let outcome = self
            .claims
            .confirm_takeover(&self.record_id, section, &self.editor)
            .await?;
        if outcome == ClaimOutcome::Granted {
            self.ensure_heartbeat(section).await;
        }
        Ok(outcome)
    }

    /// Release a section: stop its heartbeat (which writes the idle flag)
    /// and keep the owner tag. Never fails.
    pub async fn release_section(&self, section: &str) {
        let heartbeat = self.heartbeats.lock().await.remove(section);
        match heartbeat {
            Some(heartbeat) => heartbeat.stop().await,
            None => {
                self.claims
                    .release(&self.record_id, section, &self.editor)
                    .await
            }
        }
    }

    /// Set one counter field to an absolute value. Validates and clamps
    /// locally, updates the optimistic state, and hands the reconciled
    /// value to the coalescer. No network call happens on rejection.
    pub async fn set_field(&self, counter_key: &str, field: CounterField, value: i64) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PodiumError::Subscription("session closed".into()));
        }
        if value < 0 {
            return Err(PodiumError::Validation(format!(
                "{} cannot be negative",
                field.as_str()
            )));
        }
        let value = u32::try_from(value)
            .map_err(|_| PodiumError::Validation(format!("{} out of range", field.as_str())))?;

        let owned_sections: Vec<String> = self.heartbeats.lock().await.keys().cloned().collect();

        let mut updates: Vec<(CounterField, u32)> = Vec::new();
        let section;
        {
            let mut state = self.state.write().await;
            if state.sealed {
                return Err(PodiumError::RecordSealed(self.record_id.clone()));
            }
            let counter = state
                .counts
                .get(counter_key)
                .ok_or_else(|| PodiumError::NotFound(format!("counter {}", counter_key)))?;
            section = counter.section.clone();

            // A section we hold a heartbeat on is ours even while the
            // grant snapshot is still in flight.
            let editable = self.editor.is_admin()
                || owned_sections.contains(&section)
                || state
                    .section_meta(&section)
                    .map(|meta| match &meta.owner_id {
                        None => true,
                        Some(owner) => owner == self.editor.id.as_str(),
                    })
                    .unwrap_or(false);
            if !editable {
                let holder = state
                    .section_meta(&section)
                    .and_then(|meta| meta.owner_label.clone())
                    .unwrap_or_else(|| "someone else".to_string());
                return Err(PodiumError::OwnershipLost(format!(
                    "section {} is held by {}",
                    section, holder
                )));
            }

            let counter = state
                .counts
                .get_mut(counter_key)
                .ok_or_else(|| PodiumError::NotFound(format!("counter {}", counter_key)))?;

            // Subset fields clamp to the current total; they never raise it.
            let value = if field.is_subset() {
                value.min(counter.total)
            } else {
                value
            };
            counter.set_field(field, value);
            updates.push((field, value));

            // Lowering total drags the subsets down with it so the flushed
            // patch preserves the invariants server-side too.
            if field == CounterField::Total {
                if counter.local > counter.total {
                    counter.local = counter.total;
                    updates.push((CounterField::Local, counter.local));
                }
                if counter.leaders > counter.total {
                    counter.leaders = counter.total;
                    updates.push((CounterField::Leaders, counter.leaders));
                }
            }
        }

        let guard = self.guard_for(&section).await;
        for (field, value) in updates {
            self.coalescer
                .buffer(counter_key, field, value, guard.clone())
                .await;
        }
        Ok(())
    }

    /// Tap "+1" on a field.
    pub async fn increment(&self, counter_key: &str, field: CounterField) -> Result<()> {
        let current = self.current_value(counter_key, field).await?;
        self.set_field(counter_key, field, i64::from(current) + 1).await
    }

    /// Tap "-1" on a field; floors at zero.
    pub async fn decrement(&self, counter_key: &str, field: CounterField) -> Result<()> {
        let current = self.current_value(counter_key, field).await?;
        self.set_field(counter_key, field, i64::from(current.saturating_sub(1)))
            .await
    }

    /// Derived visitors for one counter.
    pub async fn visitors(&self, counter_key: &str) -> Result<u32> {
        let state = self.state.read().await;
        state
            .counter(counter_key)
            .map(|counter| counter.visitors())
            .ok_or_else(|| PodiumError::NotFound(format!("counter {}", counter_key)))
    }

    /// Group-header sums, recomputed from the live snapshot.
    pub async fn section_totals(&self) -> std::collections::BTreeMap<String, SectionTotals> {
        self.state.read().await.section_totals()
    }

    /// Close the session: release owned sections, stop heartbeats, drop
    /// pending buffers, end the subscription. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let heartbeats: Vec<(String, Heartbeat)> =
            self.heartbeats.lock().await.drain().collect();
        for (section, heartbeat) in heartbeats {
            heartbeat.stop().await;
            debug!(record_id = %self.record_id, section, "Released on close");
        }
        self.coalescer.shutdown().await;
        self.snapshot_task.abort();
        debug!(record_id = %self.record_id, editor = %self.editor.id, "Closed counter session");
    }

    async fn ensure_heartbeat(&self, section: &str) {
        let mut heartbeats = self.heartbeats.lock().await;
        heartbeats.entry(section.to_string()).or_insert_with(|| {
            Heartbeat::start(
                Arc::clone(&self.store),
                &self.config,
                self.record_id.clone(),
                section.to_string(),
                self.editor.id.clone(),
            )
        });
    }

    /// Guard carried by flushes for this section: admins write unguarded
    /// (force-edit parity with force-claim), everyone else pins the owner
    /// they believe in - themselves for a claimed section, nobody for a
    /// free one. Owned sections are read from the heartbeat map rather
    /// than the snapshot, which may not have echoed the grant back yet.
    async fn guard_for(&self, section: &str) -> Option<OwnerGuard> {
        if self.editor.is_admin() {
            return None;
        }
        if self.heartbeats.lock().await.contains_key(section) {
            return Some(OwnerGuard {
                section: section.to_string(),
                expected_owner: Some(self.editor.id.as_str().to_string()),
            });
        }
        let state = self.state.read().await;
        let expected_owner = state.section_meta(section).and_then(|meta| {
            meta.owner_id
                .as_deref()
                .filter(|owner| *owner == self.editor.id.as_str())
                .map(str::to_string)
        });
        Some(OwnerGuard {
            section: section.to_string(),
            expected_owner,
        })
    }

    async fn current_value(&self, counter_key: &str, field: CounterField) -> Result<u32> {
        let state = self.state.read().await;
        state
            .counter(counter_key)
            .map(|counter| counter.field(field))
            .ok_or_else(|| PodiumError::NotFound(format!("counter {}", counter_key)))
    }
}

/// Applies store events to the local state until the subscription ends.
async fn snapshot_loop(
    mut store_rx: broadcast::Receiver<StoreEvent>,
    state: Arc<RwLock<EventRecord>>,
    events: mpsc::Sender<SessionEvent>,
    store: Arc<dyn RecordStore>,
    coalescer: WriteCoalescer,
    record_id: String,
    me: ClientId,
) {
    loop {
        match store_rx.recv().await {
            Ok(StoreEvent::Updated(mut record)) => {
                coalescer.overlay(&mut record).await;
                *state.write().await = record;
                if events.send(SessionEvent::Updated).await.is_err() {
                    break;
                }
            }
            Ok(StoreEvent::AccessRevoked { client_id }) if client_id == me => {
                debug!(record_id, client = %me, "Access revoked, ending session quietly");
                let _ = events.send(SessionEvent::AccessRevoked).await;
                break;
            }
            Ok(StoreEvent::AccessRevoked { .. }) => {}
            Ok(StoreEvent::Deleted) => {
                let _ = events.send(SessionEvent::Deleted).await;
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed snapshots are harmless; resync from the store.
                warn!(record_id, skipped, "Snapshot feed lagged, resyncing");
                match store.get_record(&record_id, &me).await {
                    Ok(mut record) => {
                        coalescer.overlay(&mut record).await;
                        *state.write().await = record;
                        if events.send(SessionEvent::Updated).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_quiet_termination() => {
                        let _ = events.send(SessionEvent::AccessRevoked).await;
                        break;
                    }
                    Err(e) => warn!(record_id, error = %e, "Resync failed"),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
