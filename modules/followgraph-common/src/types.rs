use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CommonError;

// --- Entities ---

/// Account id on the remote social API. Stored as a graph integer.
///
/// Work messages carry it either as a JSON number or as a numeric string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl EntityId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(EntityId)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId(id)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(id) => Ok(EntityId(id)),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// An account referenced by a work message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// Private accounts are never expanded.
    #[serde(default)]
    pub protected: bool,
}

/// Body of a work-queue message: `{"user": {"id": .., "protected": ..}}`.
/// Fields beyond these are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub user: Entity,
}

impl TaskPayload {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Direction of a relationship listing relative to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    /// Accounts that follow the entity.
    Followers,
    /// Accounts the entity follows.
    Friends,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Followers => write!(f, "followers-of"),
            Self::Friends => write!(f, "followees-of"),
        }
    }
}

// --- Credentials ---

/// One bundle of API authorization material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub oauth_token: String,
    pub oauth_token_secret: String,
}

impl Credentials {
    /// All four fields are present. Incomplete bundles never reach a client.
    pub fn is_complete(&self) -> bool {
        !self.consumer_key.is_empty()
            && !self.consumer_secret.is_empty()
            && !self.oauth_token.is_empty()
            && !self.oauth_token_secret.is_empty()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CommonError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"[REDACTED]")
            .field("oauth_token", &"[REDACTED]")
            .field("oauth_token_secret", &"[REDACTED]")
            .finish()
    }
}

/// Credentials bundles indexed by worker ordinal.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct CredentialsTable(Vec<Credentials>);

impl CredentialsTable {
    /// Read the table from a JSON array file. An empty table is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CommonError> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        let table: Self = serde_json::from_slice(&raw)?;
        if table.is_empty() {
            return Err(CommonError::Credentials(format!(
                "credentials table {} is empty",
                path.display()
            )));
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The bundle for worker `index`.
    pub fn select(&self, index: usize) -> Result<&Credentials, CommonError> {
        self.0.get(index).ok_or_else(|| {
            CommonError::Credentials(format!(
                "no credentials at index {index} (table has {} entries)",
                self.0.len()
            ))
        })
    }
}

// --- Status ---

/// Point-in-time worker snapshot, published in reply to `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub running: bool,
}
