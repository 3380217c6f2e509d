//! Shared types: errors and editor identity

mod error;

pub use error::{PodiumError, Result};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque client identity, supplied by the external auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Rank of an editor within the jurisdiction hierarchy, as far as this
/// core cares: administrators may force-claim and force-edit anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Counter,
    Admin,
}

/// An authenticated person editing an event, as handed to us by the
/// auth/jurisdiction layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Editor {
    pub id: ClientId,
    pub label: String,
    pub role: Role,
}

impl Editor {
    pub fn new(id: impl Into<String>, label: impl Into<String>, role: Role) -> Self {
        Self {
            id: ClientId(id.into()),
            label: label.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
