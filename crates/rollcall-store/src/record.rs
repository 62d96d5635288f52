use chrono::{DateTime, NaiveDateTime, Utc};
use rollcall_core::FeatureVector;
use serde::Serialize;

/// Caller-supplied fields for a new identity.
///
/// Everything except `name` defaults to empty. `id` is assigned by the store
/// when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: Option<i64>,
    pub name: String,
    pub gender: String,
    pub position: String,
    pub department: String,
    pub person_type: String,
    pub entry_date: String,
}

impl Profile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Reason the profile cannot be stored, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        match self.id {
            Some(id) if id <= 0 => Err(format!("id must be positive, got {id}")),
            _ => Ok(()),
        }
    }
}

/// One stored identity.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityRecord {
    pub id: i64,
    pub name: String,
    pub gender: String,
    pub position: String,
    pub department: String,
    pub person_type: String,
    pub entry_date: String,
    #[serde(skip)]
    pub features: FeatureVector,
    #[serde(skip)]
    pub face_image: Option<Vec<u8>>,
    pub create_time: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn profile(&self) -> Profile {
        Profile {
            id: Some(self.id),
            name: self.name.clone(),
            gender: self.gender.clone(),
            position: self.position.clone(),
            department: self.department.clone(),
            person_type: self.person_type.clone(),
            entry_date: self.entry_date.clone(),
        }
    }
}

/// Little-endian f32 sequence.
pub(crate) fn encode_vector(features: &FeatureVector) -> Vec<u8> {
    features
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

pub(crate) fn decode_vector(blob: &[u8]) -> Result<FeatureVector, String> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return Err(format!("vector blob of {} bytes", blob.len()));
    }
    let raw: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    FeatureVector::normalize(&raw).ok_or_else(|| "vector is zero or not finite".to_string())
}

/// Accepts RFC 3339 and SQLite's `CURRENT_TIMESTAMP` form (taken as UTC).
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
