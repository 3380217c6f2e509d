//! Event counter record - the persisted shape of one event's counts
//!
//! One record per rehearsal event: a map of per-instrument counters plus
//! one ownership/liveness entry per logical section. On the wire both live
//! in a single `counts` object, section entries under `meta_<section>` keys,
//! so that field-path partial updates to different keys never collide.

mod patch;

pub use patch::{CounterField, OwnerGuard, PatchOp, RecordPatch};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::types::{PodiumError, Result};

/// Wire prefix distinguishing Section Meta entries inside the `counts` map.
pub const META_PREFIX: &str = "meta_";

/// Per-instrument tally for one event.
///
/// Invariants (held after every applied patch): `local <= total` and
/// `leaders <= total`. `visitors` is derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub total: u32,
    pub local: u32,
    pub leaders: u32,
    #[serde(default)]
    pub gender_a: u32,
    #[serde(default)]
    pub gender_b: u32,
    /// Logical grouping label, denormalized for display grouping.
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_editor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edited_at: Option<i64>,
}

impl Counter {
    pub fn zeroed(section: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            ..Default::default()
        }
    }

    /// Attendees not belonging to the hosting congregation. Derived.
    pub fn visitors(&self) -> u32 {
        self.total.saturating_sub(self.local)
    }

    /// Re-establish the subset invariants after a field write. The subset
    /// fields clamp down to `total`; `total` is never raised implicitly.
    pub fn clamp_subsets(&mut self) {
        self.local = self.local.min(self.total);
        self.leaders = self.leaders.min(self.total);
    }

    pub fn field(&self, field: CounterField) -> u32 {
        match field {
            CounterField::Total => self.total,
            CounterField::Local => self.local,
            CounterField::Leaders => self.leaders,
            CounterField::GenderA => self.gender_a,
            CounterField::GenderB => self.gender_b,
        }
    }

    pub fn set_field(&mut self, field: CounterField, value: u32) {
        match field {
            CounterField::Total => self.total = value,
            CounterField::Local => self.local = value,
            CounterField::Leaders => self.leaders = value,
            CounterField::GenderA => self.gender_a = value,
            CounterField::GenderB => self.gender_b = value,
        }
    }
}

/// Advisory ownership + liveness entry for one section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionMeta {
    /// Current advisory owner; `None` means the section is free.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub owner_label: Option<String>,
    /// True while the owner's editing UI is mounted.
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub last_heartbeat_at: Option<i64>,
}

/// How a counter splits its total for display and entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    /// Local members vs. visitors (the common case for instruments).
    #[default]
    LocalVisitor,
    /// Gender split, used by synthetic demographic counters.
    Gender,
}

/// One instrument (or demographic group) configured for the hosting
/// congregation, supplied by the event-lifecycle layer at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub key: String,
    pub section: String,
    #[serde(default)]
    pub split: Split,
}

impl InstrumentSpec {
    pub fn new(key: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            section: section.into(),
            split: Split::LocalVisitor,
        }
    }

    pub fn gender(key: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            section: section.into(),
            split: Split::Gender,
        }
    }
}

/// Initial counter layout for a newly scheduled event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventPlan {
    pub instruments: Vec<InstrumentSpec>,
}

impl EventPlan {
    pub fn new(instruments: Vec<InstrumentSpec>) -> Self {
        Self { instruments }
    }
}

/// The whole shared record for one event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub counts: BTreeMap<String, Counter>,
    pub sections: BTreeMap<String, SectionMeta>,
    /// Set once the event is administratively closed; the record is
    /// immutable from then on.
    #[serde(default)]
    pub sealed: bool,
    /// Store-side monotonic snapshot counter, for log ordering only.
    #[serde(default)]
    pub revision: u64,
}

impl EventRecord {
    /// Seed a record from the congregation's instrument plan: one zeroed
    /// counter per instrument, one free meta entry per distinct section.
    pub fn seeded(plan: &EventPlan) -> Self {
        let mut counts = BTreeMap::new();
        let mut sections = BTreeMap::new();
        for spec in &plan.instruments {
            counts.insert(spec.key.clone(), Counter::zeroed(&spec.section));
            sections
                .entry(spec.section.clone())
                .or_insert_with(SectionMeta::default);
        }
        Self {
            counts,
            sections,
            sealed: false,
            revision: 0,
        }
    }

    pub fn counter(&self, key: &str) -> Option<&Counter> {
        self.counts.get(key)
    }

    pub fn section_meta(&self, section: &str) -> Option<&SectionMeta> {
        self.sections.get(section)
    }

    /// Sum of every counter in a section. Pure fold over the live
    /// snapshot, recomputed on each call - never stored.
    pub fn section_totals(&self) -> BTreeMap<String, SectionTotals> {
        let mut totals: BTreeMap<String, SectionTotals> = BTreeMap::new();
        for counter in self.counts.values() {
            let entry = totals.entry(counter.section.clone()).or_default();
            entry.total += counter.total;
            entry.local += counter.local;
            entry.leaders += counter.leaders;
            entry.visitors += counter.visitors();
        }
        totals
    }

    /// Serialize to the wire document: a single `counts` object with the
    /// section entries under `meta_<section>` keys.
    pub fn to_document(&self) -> Result<Value> {
        let mut map = Map::new();
        for (key, counter) in &self.counts {
            map.insert(key.clone(), serde_json::to_value(counter)?);
        }
        for (section, meta) in &self.sections {
            map.insert(
                format!("{}{}", META_PREFIX, section),
                serde_json::to_value(meta)?,
            );
        }
        Ok(json!({ "counts": Value::Object(map) }))
    }

    /// Parse the wire document back into a record.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let counts_obj = doc
            .get("counts")
            .and_then(Value::as_object)
            .ok_or_else(|| PodiumError::Validation("document has no counts map".into()))?;

        let mut record = Self::default();
        for (key, value) in counts_obj {
            if let Some(section) = key.strip_prefix(META_PREFIX) {
                let meta: SectionMeta = serde_json::from_value(value.clone())?;
                record.sections.insert(section.to_string(), meta);
            } else {
                let counter: Counter = serde_json::from_value(value.clone())?;
                record.counts.insert(key.clone(), counter);
            }
        }
        Ok(record)
    }
}

/// Aggregated numbers for one section's group header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionTotals {
    pub total: u32,
    pub local: u32,
    pub leaders: u32,
    pub visitors: u32,
}
