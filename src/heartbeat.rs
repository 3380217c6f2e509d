//! Section liveness signal
//!
//! While an owner's editing UI is mounted, the section's meta entry keeps
//! `is_active = true` with a fresh `last_heartbeat_at`. The grant write
//! makes the first announcement; this handle refreshes it well inside the
//! TTL and writes the symmetric `is_active = false` on every exit path it
//! can reach. Every write carries the owner guard, so once the section is
//! claimed away (force-claim, takeover) this handle's writes become no-ops
//! on the new owner's claim. All heartbeat writes are best-effort: losing
//! a "went idle" signal only degrades UX, it never corrupts counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::record::RecordPatch;
use crate::store::RecordStore;
use crate::types::{ClientId, PodiumError};

/// Liveness handle for one claimed section.
pub struct Heartbeat {
    store: Arc<dyn RecordStore>,
    record_id: String,
    section: String,
    client_id: ClientId,
    refresh_task: JoinHandle<()>,
    silenced: Arc<AtomicBool>,
}

impl Heartbeat {
    /// Start refreshing a freshly granted section. The grant itself
    /// already wrote `is_active = true`; the spawned task only keeps the
    /// timestamp inside the TTL.
    pub fn start(
        store: Arc<dyn RecordStore>,
        config: &CoreConfig,
        record_id: impl Into<String>,
        section: impl Into<String>,
        client_id: ClientId,
    ) -> Self {
        let record_id = record_id.into();
        let section = section.into();
        let interval = config.heartbeat_refresh_interval();

        let task_store = Arc::clone(&store);
        let task_record = record_id.clone();
        let task_section = section.clone();
        let task_client = client_id.clone();
        let refresh_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The grant write was the first announcement.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let patch = RecordPatch::new()
                    .set_active(&task_section, true, Utc::now().timestamp_millis())
                    .with_guard(&task_section, Some(task_client.as_str().to_string()));
                match task_store
                    .apply_patch(&task_record, &task_client, patch)
                    .await
                {
                    Ok(()) => {}
                    // The section was claimed away; stop announcing.
                    Err(PodiumError::OwnershipLost(_)) => {
                        debug!(
                            record_id = %task_record,
                            section = %task_section,
                            "Section no longer held, refresh stopped"
                        );
                        return;
                    }
                    Err(e) => {
                        // Swallowed: the next claimant's TTL check resolves it.
                        warn!(
                            record_id = %task_record,
                            section = %task_section,
                            error = %e,
                            "Heartbeat refresh failed"
                        );
                    }
                }
            }
        });

        Self {
            store,
            record_id,
            section,
            client_id,
            refresh_task,
            silenced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Announce that the editor unmounted: stop refreshing and write
    /// `is_active = false`, guarded on still owning the section. A no-op
    /// once the section belongs to someone else. Idempotent; failures are
    /// swallowed.
    pub async fn stop(&self) {
        if self.silenced.swap(true, Ordering::SeqCst) {
            return;
        }
        self.refresh_task.abort();
        let patch = RecordPatch::new()
            .set_active(&self.section, false, Utc::now().timestamp_millis())
            .with_guard(&self.section, Some(self.client_id.as_str().to_string()));
        match self
            .store
            .apply_patch(&self.record_id, &self.client_id, patch)
            .await
        {
            Ok(()) => {
                debug!(
                    record_id = %self.record_id,
                    section = %self.section,
                    "Section went idle"
                );
            }
            Err(PodiumError::OwnershipLost(_)) => {
                debug!(
                    record_id = %self.record_id,
                    section = %self.section,
                    "Section already reclaimed, silence skipped"
                );
            }
            Err(e) => {
                warn!(
                    record_id = %self.record_id,
                    section = %self.section,
                    error = %e,
                    "Heartbeat silence write failed"
                );
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.refresh_task.abort();
        if self.silenced.swap(true, Ordering::SeqCst) {
            return;
        }
        // Teardown paths that never awaited stop() still get a best-effort
        // silence write, when a runtime is around to run it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let record_id = self.record_id.clone();
            let section = self.section.clone();
            let client_id = self.client_id.clone();
            handle.spawn(async move {
                let patch = RecordPatch::new()
                    .set_active(&section, false, Utc::now().timestamp_millis())
                    .with_guard(&section, Some(client_id.as_str().to_string()));
                if let Err(e) = store.apply_patch(&record_id, &client_id, patch).await {
                    debug!(record_id, section, error = %e, "Drop-time silence failed");
                }
            });
        }
    }
}
