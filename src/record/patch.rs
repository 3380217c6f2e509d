//! Field-path patch language for partial record updates
//!
//! Updates are always field-path patches (`counts.<key>.<field> = value`),
//! never full-document rewrites, so concurrent edits to different keys
//! survive each other. A patch applies atomically: sealed check, then the
//! optional owner guard, then every op, then one snapshot fan-out.

use serde::{Deserialize, Serialize};

/// Numeric counter field addressable by a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CounterField {
    Total,
    Local,
    Leaders,
    GenderA,
    GenderB,
}

impl CounterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Local => "local",
            Self::Leaders => "leaders",
            Self::GenderA => "genderA",
            Self::GenderB => "genderB",
        }
    }

    /// `local` and `leaders` are subsets of `total` and clamp to it.
    pub fn is_subset(&self) -> bool {
        matches!(self, Self::Local | Self::Leaders)
    }

    /// Dotted wire path for this field on a given counter, as an external
    /// document-store adapter would address it.
    pub fn field_path(&self, counter_key: &str) -> String {
        format!("counts.{}.{}", counter_key, self.as_str())
    }
}

/// One partial update operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum PatchOp {
    /// `counts.<key>.<field> = value`
    SetCounterField {
        key: String,
        field: CounterField,
        value: u32,
    },
    /// Last-writer audit trail on a counter.
    SetAudit {
        key: String,
        editor_id: String,
        edited_at: i64,
    },
    /// Full ownership grant on a section's meta entry.
    SetSectionMeta {
        section: String,
        owner_id: Option<String>,
        owner_label: Option<String>,
        is_active: bool,
        last_heartbeat_at: Option<i64>,
    },
    /// Liveness-only update; leaves the owner tag untouched.
    SetActive {
        section: String,
        is_active: bool,
        last_heartbeat_at: Option<i64>,
    },
}

/// Compare-and-swap guard: the patch only applies while the section's
/// owner matches the writer's expectation. Closes the hole where a stale
/// client silently overwrites a counter it no longer holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerGuard {
    pub section: String,
    pub expected_owner: Option<String>,
}

/// A batch of ops applied atomically to one record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordPatch {
    pub ops: Vec<PatchOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<OwnerGuard>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_field(mut self, key: impl Into<String>, field: CounterField, value: u32) -> Self {
        self.ops.push(PatchOp::SetCounterField {
            key: key.into(),
            field,
            value,
        });
        self
    }

    pub fn audit(mut self, key: impl Into<String>, editor_id: impl Into<String>, edited_at: i64) -> Self {
        self.ops.push(PatchOp::SetAudit {
            key: key.into(),
            editor_id: editor_id.into(),
            edited_at,
        });
        self
    }

    pub fn grant_section(
        mut self,
        section: impl Into<String>,
        owner_id: impl Into<String>,
        owner_label: impl Into<String>,
        now: i64,
    ) -> Self {
        self.ops.push(PatchOp::SetSectionMeta {
            section: section.into(),
            owner_id: Some(owner_id.into()),
            owner_label: Some(owner_label.into()),
            is_active: true,
            last_heartbeat_at: Some(now),
        });
        self
    }

    pub fn set_active(mut self, section: impl Into<String>, is_active: bool, now: i64) -> Self {
        self.ops.push(PatchOp::SetActive {
            section: section.into(),
            is_active,
            last_heartbeat_at: Some(now),
        });
        self
    }

    pub fn with_guard(mut self, section: impl Into<String>, expected_owner: Option<String>) -> Self {
        self.guard = Some(OwnerGuard {
            section: section.into(),
            expected_owner,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Wire paths touched by this patch, for logging.
    pub fn touched_paths(&self) -> Vec<String> {
        self.ops
            .iter()
            .map(|op| match op {
                PatchOp::SetCounterField { key, field, .. } => field.field_path(key),
                PatchOp::SetAudit { key, .. } => format!("counts.{}.lastEditorId", key),
                PatchOp::SetSectionMeta { section, .. } => {
                    format!("counts.meta_{}.ownerId", section)
                }
                PatchOp::SetActive { section, .. } => {
                    format!("counts.meta_{}.isActive", section)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_paths() {
        assert_eq!(CounterField::Total.field_path("violin"), "counts.violin.total");
        assert_eq!(
            CounterField::GenderA.field_path("choir_adults"),
            "counts.choir_adults.genderA"
        );
    }

    #[test]
    fn test_subset_fields() {
        assert!(CounterField::Local.is_subset());
        assert!(CounterField::Leaders.is_subset());
        assert!(!CounterField::Total.is_subset());
        assert!(!CounterField::GenderA.is_subset());
    }

    #[test]
    fn test_builder_collects_ops() {
        let patch = RecordPatch::new()
            .set_field("violin", CounterField::Total, 5)
            .set_field("violin", CounterField::Local, 4)
            .audit("violin", "c-1", 1000)
            .with_guard("strings", Some("c-1".into()));

        assert_eq!(patch.ops.len(), 3);
        assert_eq!(patch.guard.as_ref().unwrap().section, "strings");
        assert_eq!(patch.touched_paths()[0], "counts.violin.total");
    }
}
