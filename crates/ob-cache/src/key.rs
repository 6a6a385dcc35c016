//! Deterministic cache keys derived from everything that affects a result.

use ob_types::CacheError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Content address of one cache entry.
///
/// The fingerprint is the SHA-256 of the namespace and the canonical JSON of
/// the key material. Objects serialize with sorted keys, so identical inputs
/// hash identically across processes and machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    namespace: String,
    fingerprint: String,
    material: Value,
}

impl CacheKey {
    pub fn new(namespace: &str, material: &impl Serialize) -> Result<Self, CacheError> {
        let material = canonicalize(serde_json::to_value(material)?);
        let fingerprint = fingerprint(namespace, &material)?;
        Ok(Self {
            namespace: namespace.to_string(),
            fingerprint,
            material,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn material(&self) -> &Value {
        &self.material
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, &self.fingerprint[..12])
    }
}

/// Rebuild objects with sorted keys, whatever map ordering serde_json was
/// compiled with.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Hash a namespace and its key material.
pub(crate) fn fingerprint(namespace: &str, material: &Value) -> Result<String, CacheError> {
    let canonical = serde_json::to_vec(material)?;
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}
