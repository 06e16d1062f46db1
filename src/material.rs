//! Subjects, key material and the per-subject aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{GeneratedKey, SecureKey};
use crate::error::{KeyMaterialError, Result};

/// Identity a key is scoped to; also the partition key of every command
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    /// Validate and wrap a subject id. Blank ids are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(KeyMaterialError::Validation("subject id must not be blank".into()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One committed symmetric key for a subject. Never mutated once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub id: Uuid,
    pub subject: Subject,
    pub algorithm: String,
    pub key: SecureKey,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl Material {
    /// First version of a subject's material built from generated key bytes
    pub fn first(subject: Subject, generated: GeneratedKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            algorithm: generated.algorithm,
            key: generated.key,
            version: 1,
            created_at: Utc::now(),
        }
    }
}

/// Derived state of a subject: the ordered material versions.
///
/// Holds zero or one entry; more than one is reserved for rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialAggregate {
    pub materials: Vec<Material>,
}

impl MaterialAggregate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Most recent material, if any
    pub fn latest(&self) -> Option<&Material> {
        self.materials.last()
    }

    /// Return a new aggregate with `material` appended
    pub fn with_material(&self, material: Material) -> Self {
        let mut materials = self.materials.clone();
        materials.push(material);
        Self { materials }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_rejects_blank() {
        assert!(matches!(Subject::new(""), Err(KeyMaterialError::Validation(_))));
        assert!(matches!(Subject::new("  \t"), Err(KeyMaterialError::Validation(_))));
        assert_eq!(Subject::new("user-42").unwrap().as_str(), "user-42");
    }

    #[test]
    fn test_aggregate_latest() {
        let subject = Subject::new("user-1").unwrap();
        let aggregate = MaterialAggregate::empty();
        assert!(aggregate.latest().is_none());

        let material = Material::first(
            subject,
            GeneratedKey {
                algorithm: "TEST".into(),
                key: SecureKey::new(vec![7; 32]),
            },
        );
        let populated = aggregate.with_material(material.clone());

        assert!(aggregate.is_empty());
        assert_eq!(populated.latest(), Some(&material));
        assert_eq!(populated.latest().map(|m| m.version), Some(1));
    }

    #[test]
    fn test_aggregate_json_shape() {
        let subject = Subject::new("user-1").unwrap();
        let material = Material::first(
            subject,
            GeneratedKey {
                algorithm: "TEST".into(),
                key: SecureKey::new(vec![0xff; 4]),
            },
        );
        let aggregate = MaterialAggregate::empty().with_material(material);
        let json = serde_json::to_value(aggregate).unwrap();

        assert_eq!(json["materials"][0]["subject"], "user-1");
        assert_eq!(json["materials"][0]["key"], "/////w==");
    }
}
