//! Record store boundary
//!
//! The document database itself is an external collaborator; this core
//! talks to it through [`RecordStore`]. The store pushes whole-record
//! snapshots to every subscriber on any change, with no ordering promise
//! between writers beyond last-write-wins per field.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::record::{EventPlan, EventRecord, RecordPatch};
use crate::types::{ClientId, Result};

/// Change notification fanned out to subscribers of one record.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A new snapshot after any applied patch (or sealing).
    Updated(EventRecord),
    /// The named client's access was administratively revoked.
    AccessRevoked { client_id: ClientId },
    /// The whole record was deleted as a unit.
    Deleted,
}

/// Storage boundary for event counter records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a record once, atomically, seeded from the congregation's
    /// instrument plan.
    async fn create_record(&self, record_id: &str, plan: &EventPlan) -> Result<()>;

    /// Current snapshot of a record.
    async fn get_record(&self, record_id: &str, client: &ClientId) -> Result<EventRecord>;

    /// Subscribe to a record: the current snapshot plus a live event feed.
    async fn subscribe(
        &self,
        record_id: &str,
        client: &ClientId,
    ) -> Result<(EventRecord, broadcast::Receiver<StoreEvent>)>;

    /// Apply a field-path partial patch atomically and fan out the new
    /// snapshot.
    async fn apply_patch(&self, record_id: &str, client: &ClientId, patch: RecordPatch)
        -> Result<()>;

    /// Mark a record immutable (administrative close of the event).
    async fn seal_record(&self, record_id: &str) -> Result<()>;

    /// Delete a record as a unit.
    async fn delete_record(&self, record_id: &str) -> Result<()>;

    /// Withdraw a client's access mid-session. The client observes
    /// [`StoreEvent::AccessRevoked`] and every later call fails with
    /// `PermissionRevoked`.
    async fn revoke_access(&self, record_id: &str, client: &ClientId) -> Result<()>;
}
