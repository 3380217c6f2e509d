//! Podium - collaborative attendance counting core for rehearsal events
//!
//! During a rehearsal, several people on different devices count the same
//! event at once: per-instrument totals, local-member and leader subsets,
//! gender splits. Podium coordinates them over one shared event record:
//!
//! - **Record**: the persisted shape of an event's counters, updated through
//!   field-path partial patches so concurrent edits to different keys never
//!   collide
//! - **Store**: subscription fan-out over the shared record, with an
//!   in-memory reference implementation
//! - **Claims**: advisory per-section ownership so two people don't
//!   double-count the same section at the same moment
//! - **Heartbeat**: liveness flag kept fresh while an owner's editor is
//!   mounted, with TTL-based staleness for crashed clients
//! - **Coalescer**: debounces rapid taps into one merged write per counter
//! - **Session**: composes the above for one (event, editor) pair

pub mod claim;
pub mod coalesce;
pub mod config;
pub mod heartbeat;
pub mod record;
pub mod session;
pub mod store;
pub mod types;

pub use claim::{ClaimManager, ClaimOutcome};
pub use config::CoreConfig;
pub use record::{Counter, CounterField, EventPlan, EventRecord, InstrumentSpec, SectionMeta, Split};
pub use session::{CounterSession, SessionEvent};
pub use store::{MemoryStore, RecordStore, StoreEvent};
pub use types::{ClientId, Editor, PodiumError, Result, Role};
