//! In-memory record store
//!
//! Reference implementation of [`RecordStore`]: a DashMap of records, one
//! broadcast channel per record for snapshot fan-out, and a per-record set
//! of revoked clients. All tests run against it; embedders with a real
//! document database bring their own implementation of the trait.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::record::{EventPlan, EventRecord, PatchOp, RecordPatch};
use crate::store::{RecordStore, StoreEvent};
use crate::types::{ClientId, PodiumError, Result};

const DEFAULT_BROADCAST_CAPACITY: usize = 64;

struct RecordSlot {
    record: EventRecord,
    tx: broadcast::Sender<StoreEvent>,
    revoked: HashSet<ClientId>,
}

pub struct MemoryStore {
    records: DashMap<String, RecordSlot>,
    broadcast_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(broadcast_capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            broadcast_capacity,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::with_capacity(config.broadcast_capacity)
    }

    fn check_access(slot: &RecordSlot, client: &ClientId) -> Result<()> {
        if slot.revoked.contains(client) {
            return Err(PodiumError::PermissionRevoked);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_record(&self, record_id: &str, plan: &EventPlan) -> Result<()> {
        if self.records.contains_key(record_id) {
            return Err(PodiumError::AlreadyExists(record_id.to_string()));
        }
        let (tx, _) = broadcast::channel(self.broadcast_capacity);
        let record = EventRecord::seeded(plan);
        info!(
            record_id,
            counters = record.counts.len(),
            sections = record.sections.len(),
            "Created event record"
        );
        self.records.insert(
            record_id.to_string(),
            RecordSlot {
                record,
                tx,
                revoked: HashSet::new(),
            },
        );
        Ok(())
    }

    async fn get_record(&self, record_id: &str, client: &ClientId) -> Result<EventRecord> {
        let slot = self
            .records
            .get(record_id)
            .ok_or_else(|| PodiumError::NotFound(record_id.to_string()))?;
        Self::check_access(&slot, client)?;
        Ok(slot.record.clone())
    }

    async fn subscribe(
        &self,
        record_id: &str,
        client: &ClientId,
    ) -> Result<(EventRecord, broadcast::Receiver<StoreEvent>)> {
        let slot = self
            .records
            .get(record_id)
            .ok_or_else(|| PodiumError::NotFound(record_id.to_string()))?;
        Self::check_access(&slot, client)?;
        debug!(record_id, client = %client, "New record subscription");
        Ok((slot.record.clone(), slot.tx.subscribe()))
    }

    async fn apply_patch(
        &self,
        record_id: &str,
        client: &ClientId,
        patch: RecordPatch,
    ) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut slot = self
            .records
            .get_mut(record_id)
            .ok_or_else(|| PodiumError::NotFound(record_id.to_string()))?;
        Self::check_access(&slot, client)?;

        if slot.record.sealed {
            return Err(PodiumError::RecordSealed(record_id.to_string()));
        }

        // Compare-and-swap on the section owner before anything lands.
        if let Some(guard) = &patch.guard {
            let meta = slot
                .record
                .sections
                .get(&guard.section)
                .ok_or_else(|| PodiumError::NotFound(format!("section {}", guard.section)))?;
            if meta.owner_id != guard.expected_owner {
                return Err(PodiumError::OwnershipLost(format!(
                    "section {} is held by {}",
                    guard.section,
                    meta.owner_id.as_deref().unwrap_or("nobody")
                )));
            }
        }

        // Validate every target up front so a bad op leaves nothing behind.
        for op in &patch.ops {
            match op {
                PatchOp::SetCounterField { key, .. } | PatchOp::SetAudit { key, .. } => {
                    if !slot.record.counts.contains_key(key) {
                        return Err(PodiumError::NotFound(format!("counter {}", key)));
                    }
                }
                PatchOp::SetSectionMeta { section, .. } | PatchOp::SetActive { section, .. } => {
                    if !slot.record.sections.contains_key(section) {
                        return Err(PodiumError::NotFound(format!("section {}", section)));
                    }
                }
            }
        }

        let mut touched_counters: Vec<String> = Vec::new();
        for op in &patch.ops {
            match op {
                PatchOp::SetCounterField { key, field, value } => {
                    let counter = slot
                        .record
                        .counts
                        .get_mut(key)
                        .ok_or_else(|| PodiumError::NotFound(format!("counter {}", key)))?;
                    counter.set_field(*field, *value);
                    if !touched_counters.contains(key) {
                        touched_counters.push(key.clone());
                    }
                }
                PatchOp::SetAudit {
                    key,
                    editor_id,
                    edited_at,
                } => {
                    let counter = slot
                        .record
                        .counts
                        .get_mut(key)
                        .ok_or_else(|| PodiumError::NotFound(format!("counter {}", key)))?;
                    counter.last_editor_id = Some(editor_id.clone());
                    counter.last_edited_at = Some(*edited_at);
                }
                PatchOp::SetSectionMeta {
                    section,
                    owner_id,
                    owner_label,
                    is_active,
                    last_heartbeat_at,
                } => {
                    let meta = slot
                        .record
                        .sections
                        .get_mut(section)
                        .ok_or_else(|| PodiumError::NotFound(format!("section {}", section)))?;
                    meta.owner_id = owner_id.clone();
                    meta.owner_label = owner_label.clone();
                    meta.is_active = *is_active;
                    meta.last_heartbeat_at = *last_heartbeat_at;
                }
                PatchOp::SetActive {
                    section,
                    is_active,
                    last_heartbeat_at,
                } => {
                    let meta = slot
                        .record
                        .sections
                        .get_mut(section)
                        .ok_or_else(|| PodiumError::NotFound(format!("section {}", section)))?;
                    meta.is_active = *is_active;
                    meta.last_heartbeat_at = *last_heartbeat_at;
                }
            }
        }

        // Subset invariants are re-established once every op has landed,
        // so a merged flush may raise total and local in either op order.
        for key in &touched_counters {
            if let Some(counter) = slot.record.counts.get_mut(key) {
                counter.clamp_subsets();
            }
        }

        slot.record.revision += 1;
        debug!(
            record_id,
            client = %client,
            revision = slot.record.revision,
            paths = ?patch.touched_paths(),
            "Applied patch"
        );

        let snapshot = slot.record.clone();
        let _ = slot.tx.send(StoreEvent::Updated(snapshot));
        Ok(())
    }

    async fn seal_record(&self, record_id: &str) -> Result<()> {
        let mut slot = self
            .records
            .get_mut(record_id)
            .ok_or_else(|| PodiumError::NotFound(record_id.to_string()))?;
        slot.record.sealed = true;
        slot.record.revision += 1;
        info!(record_id, "Sealed event record");
        let snapshot = slot.record.clone();
        let _ = slot.tx.send(StoreEvent::Updated(snapshot));
        Ok(())
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        let (_, slot) = self
            .records
            .remove(record_id)
            .ok_or_else(|| PodiumError::NotFound(record_id.to_string()))?;
        info!(record_id, "Deleted event record");
        let _ = slot.tx.send(StoreEvent::Deleted);
        Ok(())
    }

    async fn revoke_access(&self, record_id: &str, client: &ClientId) -> Result<()> {
        let mut slot = self
            .records
            .get_mut(record_id)
            .ok_or_else(|| PodiumError::NotFound(record_id.to_string()))?;
        slot.revoked.insert(client.clone());
        info!(record_id, client = %client, "Revoked record access");
        let _ = slot.tx.send(StoreEvent::AccessRevoked {
            client_id: client.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CounterField, InstrumentSpec};

    fn plan() -> EventPlan {
        EventPlan::new(vec![
            InstrumentSpec::new("violin", "strings"),
            InstrumentSpec::new("organ", "keys"),
        ])
    }

    fn client(id: &str) -> ClientId {
        ClientId::from(id)
    }

    #[test]
    fn test_from_config_uses_configured_capacity() {
        let config = CoreConfig {
            broadcast_capacity: 8,
            ..Default::default()
        };
        let store = MemoryStore::from_config(&config);
        assert_eq!(store.broadcast_capacity, 8);
    }

    #[tokio::test]
    async fn test_create_is_once_only() {
        let store = MemoryStore::new();
        store.create_record("ev-1", &plan()).await.unwrap();
        assert!(matches!(
            store.create_record("ev-1", &plan()).await,
            Err(PodiumError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_patch_fans_out_snapshot() {
        let store = MemoryStore::new();
        store.create_record("ev-1", &plan()).await.unwrap();
        let me = client("c-1");
        let (initial, mut rx) = store.subscribe("ev-1", &me).await.unwrap();
        assert_eq!(initial.counter("violin").unwrap().total, 0);

        let patch = RecordPatch::new().set_field("violin", CounterField::Total, 3);
        store.apply_patch("ev-1", &me, patch).await.unwrap();

        match rx.recv().await.unwrap() {
            StoreEvent::Updated(snapshot) => {
                assert_eq!(snapshot.counter("violin").unwrap().total, 3);
                assert_eq!(snapshot.revision, 1);
            }
            other => panic!("expected Updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clamp_backstop_is_order_independent() {
        let store = MemoryStore::new();
        store.create_record("ev-1", &plan()).await.unwrap();
        let me = client("c-1");

        // local lands before total inside one merged patch
        let patch = RecordPatch::new()
            .set_field("violin", CounterField::Local, 5)
            .set_field("violin", CounterField::Total, 5);
        store.apply_patch("ev-1", &me, patch).await.unwrap();
        let record = store.get_record("ev-1", &me).await.unwrap();
        assert_eq!(record.counter("violin").unwrap().local, 5);

        // a lone subset write above total clamps down, total untouched
        let patch = RecordPatch::new().set_field("violin", CounterField::Local, 9);
        store.apply_patch("ev-1", &me, patch).await.unwrap();
        let record = store.get_record("ev-1", &me).await.unwrap();
        assert_eq!(record.counter("violin").unwrap().total, 5);
        assert_eq!(record.counter("violin").unwrap().local, 5);
    }

    #[tokio::test]
    async fn test_owner_guard_rejects_stale_writer() {
        let store = MemoryStore::new();
        store.create_record("ev-1", &plan()).await.unwrap();
        let me = client("c-1");

        let grant = RecordPatch::new().grant_section("strings", "c-2", "Bea", 1000);
        store.apply_patch("ev-1", &me, grant).await.unwrap();

        let guarded = RecordPatch::new()
            .set_field("violin", CounterField::Total, 9)
            .with_guard("strings", Some("c-1".into()));
        assert!(matches!(
            store.apply_patch("ev-1", &me, guarded).await,
            Err(PodiumError::OwnershipLost(_))
        ));

        // Nothing landed.
        let record = store.get_record("ev-1", &me).await.unwrap();
        assert_eq!(record.counter("violin").unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_sealed_record_refuses_patches() {
        let store = MemoryStore::new();
        store.create_record("ev-1", &plan()).await.unwrap();
        store.seal_record("ev-1").await.unwrap();

        let patch = RecordPatch::new().set_field("violin", CounterField::Total, 1);
        assert!(matches!(
            store.apply_patch("ev-1", &client("c-1"), patch).await,
            Err(PodiumError::RecordSealed(_))
        ));
    }

    #[tokio::test]
    async fn test_revocation_blocks_and_notifies() {
        let store = MemoryStore::new();
        store.create_record("ev-1", &plan()).await.unwrap();
        let me = client("c-1");
        let (_, mut rx) = store.subscribe("ev-1", &me).await.unwrap();

        store.revoke_access("ev-1", &me).await.unwrap();

        match rx.recv().await.unwrap() {
            StoreEvent::AccessRevoked { client_id } => assert_eq!(client_id, me),
            other => panic!("expected AccessRevoked, got {:?}", other),
        }
        assert!(matches!(
            store.get_record("ev-1", &me).await,
            Err(PodiumError::PermissionRevoked)
        ));
        let patch = RecordPatch::new().set_field("violin", CounterField::Total, 1);
        assert!(matches!(
            store.apply_patch("ev-1", &me, patch).await,
            Err(PodiumError::PermissionRevoked)
        ));
    }

    #[tokio::test]
    async fn test_delete_notifies_subscribers() {
        let store = MemoryStore::new();
        store.create_record("ev-1", &plan()).await.unwrap();
        let me = client("c-1");
        let (_, mut rx) = store.subscribe("ev-1", &me).await.unwrap();

        store.delete_record("ev-1").await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::Deleted));
        assert!(matches!(
            store.get_record("ev-1", &me).await,
            Err(PodiumError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_patch_on_unknown_counter_fails_whole_patch() {
        let store = MemoryStore::new();
        store.create_record("ev-1", &plan()).await.unwrap();
        let me = client("c-1");

        let patch = RecordPatch::new()
            .set_field("violin", CounterField::Total, 2)
            .set_field("tuba", CounterField::Total, 2);
        assert!(matches!(
            store.apply_patch("ev-1", &me, patch).await,
            Err(PodiumError::NotFound(_))
        ));
    }
}
