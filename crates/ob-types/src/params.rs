//! Parameter values and parametrized component names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A concrete parameter value attached to a dataset, objective or solver.
///
/// Integers are listed before floats so that untagged deserialization keeps
/// `5` as an integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<usize> for ParameterValue {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Resolved parameters of one component instance. Keys are kept sorted so
/// names and fingerprints are deterministic.
pub type Parameters = BTreeMap<String, ParameterValue>;

/// Build the canonical `name[k1=v1,k2=v2]` form used for filtering, cache
/// keys and status lines.
pub fn parametrized_name(name: &str, parameters: &Parameters) -> String {
    if parameters.is_empty() {
        return name.to_string();
    }
    let body = parameters
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}[{body}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parametrized_name_sorts_keys() {
        let mut params = Parameters::new();
        params.insert("step".into(), ParameterValue::Float(0.5));
        params.insert("momentum".into(), ParameterValue::Bool(true));

        assert_eq!(parametrized_name("gd", &params), "gd[momentum=true,step=0.5]");
        assert_eq!(parametrized_name("newton", &Parameters::new()), "newton");
    }

    #[test]
    fn untagged_values_keep_integers() {
        let v: ParameterValue = serde_json::from_str("5").unwrap();
        assert_eq!(v, ParameterValue::Int(5));

        let v: ParameterValue = serde_json::from_str("0.25").unwrap();
        assert_eq!(v, ParameterValue::Float(0.25));

        let v: ParameterValue = serde_json::from_str("\"l1\"").unwrap();
        assert_eq!(v.as_str(), Some("l1"));
    }

    #[test]
    fn numeric_accessors() {
        assert_eq!(ParameterValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(ParameterValue::Float(0.1).as_i64(), None);
        assert_eq!(ParameterValue::from("x").as_f64(), None);
    }
}
