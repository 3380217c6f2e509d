//! Advisory section ownership
//!
//! A claim records who is currently responsible for counting a section, so
//! two people don't double-count the same naipe at the same moment. It is
//! a UX aid, not a lock: the store still accepts any write, and the only
//! hard check is the owner guard the coalescer attaches to its flushes.
//! The protocol optimizes for low friction: a section is never permanently
//! locked, and a stale heartbeat is treated the same as an unmounted one.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::record::{RecordPatch, SectionMeta};
use crate::store::RecordStore;
use crate::types::{Editor, PodiumError, Result};

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the section and may edit it.
    Granted,
    /// Someone else is actively counting; the caller may only watch.
    ReadOnly { holder: String },
    /// The recorded owner looks gone (unmounted or stale heartbeat); the
    /// caller may take over, but only after explicit confirmation.
    TakeoverRequired { holder: String },
}

/// Decides and persists section ownership.
#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<dyn RecordStore>,
    config: CoreConfig,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn RecordStore>, config: CoreConfig) -> Self {
        Self { store, config }
    }

    /// Whether a meta entry counts as actively edited right now. A stale
    /// heartbeat (older than the TTL) counts as inactive even when the
    /// flag was left on by a crashed client.
    pub fn is_actively_held(&self, meta: &SectionMeta, now_ms: i64) -> bool {
        if !meta.is_active {
            return false;
        }
        match meta.last_heartbeat_at {
            Some(at) => now_ms.saturating_sub(at) <= self.config.heartbeat_ttl().as_millis() as i64,
            None => false,
        }
    }

    /// Attempt to claim a section for the editor.
    pub async fn claim(
        &self,
        record_id: &str,
        section: &str,
        editor: &Editor,
    ) -> Result<ClaimOutcome> {
        let record = self.store.get_record(record_id, &editor.id).await?;
        if record.sealed {
            return Err(PodiumError::RecordSealed(record_id.to_string()));
        }
        let meta = record
            .section_meta(section)
            .ok_or_else(|| PodiumError::NotFound(format!("section {}", section)))?;

        let now_ms = Utc::now().timestamp_millis();
        match &meta.owner_id {
            // Free, or re-entry by the current owner: grant.
            None => self.grant(record_id, section, editor).await,
            Some(owner) if owner == editor.id.as_str() => {
                self.grant(record_id, section, editor).await
            }
            // Administrators force-claim past anyone.
            Some(_) if editor.is_admin() => {
                info!(record_id, section, admin = %editor.id, "Admin force-claim");
                self.grant(record_id, section, editor).await
            }
            Some(_) if self.is_actively_held(meta, now_ms) => {
                let holder = holder_label(meta);
                debug!(record_id, section, holder, "Claim refused, section active");
                Ok(ClaimOutcome::ReadOnly { holder })
            }
            // Owner's UI is gone (or its heartbeat went stale): offer takeover.
            Some(_) => {
                let holder = holder_label(meta);
                debug!(record_id, section, holder, "Stale claim, takeover offered");
                Ok(ClaimOutcome::TakeoverRequired { holder })
            }
        }
    }

    /// Execute a takeover the user explicitly confirmed. Same write path
    /// as a fresh grant; overwrites the previous owner tag.
    pub async fn confirm_takeover(
        &self,
        record_id: &str,
        section: &str,
        editor: &Editor,
    ) -> Result<ClaimOutcome> {
        let record = self.store.get_record(record_id, &editor.id).await?;
        if record.sealed {
            return Err(PodiumError::RecordSealed(record_id.to_string()));
        }
        info!(record_id, section, editor = %editor.id, "Confirmed takeover");
        self.grant(record_id, section, editor).await
    }

    /// Release a section the editor owns: drops the liveness flag but
    /// keeps `owner_id` as the last-known-responsible tag. Best-effort and
    /// idempotent; failures are swallowed.
    pub async fn release(&self, record_id: &str, section: &str, editor: &Editor) {
        let record = match self.store.get_record(record_id, &editor.id).await {
            Ok(record) => record,
            Err(e) => {
                debug!(record_id, section, error = %e, "Release skipped");
                return;
            }
        };
        let owns = record
            .section_meta(section)
            .is_some_and(|meta| meta.owner_id.as_deref() == Some(editor.id.as_str()));
        if !owns {
            return;
        }

        let patch = RecordPatch::new().set_active(section, false, Utc::now().timestamp_millis());
        if let Err(e) = self.store.apply_patch(record_id, &editor.id, patch).await {
            warn!(record_id, section, error = %e, "Release write failed, ignoring");
        } else {
            debug!(record_id, section, editor = %editor.id, "Released section");
        }
    }

    async fn grant(&self, record_id: &str, section: &str, editor: &Editor) -> Result<ClaimOutcome> {
        let patch = RecordPatch::new().grant_section(
            section,
            editor.id.as_str(),
            editor.label.clone(),
            Utc::now().timestamp_millis(),
        );
        self.store.apply_patch(record_id, &editor.id, patch).await?;
        debug!(record_id, section, owner = %editor.id, "Granted section");
        Ok(ClaimOutcome::Granted)
    }
}

fn holder_label(meta: &SectionMeta) -> String {
    meta.owner_label
        .clone()
        .or_else(|| meta.owner_id.clone())
        .unwrap_or_else(|| "unknown".to_string())
}
