//! Commands appended to the commands topic

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::material::{Material, Subject};

/// Intent recorded in the commit log for one subject.
///
/// Records are JSON, internally tagged by `type`. Tags this build does not
/// know decode to [`Command::Unknown`] instead of failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Create material for the subject, generated by the aggregation stage
    Create { subject: Subject },
    /// Register caller-generated material for the subject
    Register { subject: Subject, material: Material },
    /// Forget the subject
    Forget { subject: Subject },
    #[serde(other)]
    Unknown,
}

impl Command {
    pub fn subject(&self) -> Option<&Subject> {
        match self {
            Command::Create { subject }
            | Command::Register { subject, .. }
            | Command::Forget { subject } => {
                Some(subject)
            }
            Command::Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Register { .. } => "register",
            Command::Forget { .. } => "forget",
            Command::Unknown => "unknown",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
