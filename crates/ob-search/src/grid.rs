//! Parameter grids and their expansion into concrete parameter sets.

use ob_types::{ConfigError, ParameterValue, Parameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One grid dimension. Several names may be bound together, in which case
/// every entry of `values` is a tuple with one value per name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAxis {
    pub names: Vec<String>,
    pub values: Vec<Vec<ParameterValue>>,
}

/// Ordered list of axes, expanded by ordinary Cartesian product. The first
/// axis varies slowest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    pub axes: Vec<GridAxis>,
}

impl ParameterGrid {
    pub fn new() -> Self {
        Self { axes: Vec::new() }
    }

    /// Add an axis over a single parameter.
    pub fn add<V: Into<ParameterValue>>(mut self, name: impl Into<String>, values: Vec<V>) -> Self {
        self.axes.push(GridAxis {
            names: vec![name.into()],
            values: values.into_iter().map(|v| vec![v.into()]).collect(),
        });
        self
    }

    /// Add an axis binding several parameters at once. `names` is a comma
    /// separated list, e.g. `"lr, momentum"`.
    pub fn add_joint(mut self, names: &str, tuples: Vec<Vec<ParameterValue>>) -> Self {
        self.axes.push(GridAxis {
            names: split_names(names),
            values: tuples,
        });
        self
    }

    /// Read a grid from a JSON object such as
    /// `{"step": [0.1, 1.0], "lr, momentum": [[0.1, 0.9], [0.01, 0.0]]}`.
    pub fn from_json(component: &str, value: &Value) -> Result<Self, ConfigError> {
        let malformed = |message: String| ConfigError::MalformedGrid {
            component: component.to_string(),
            message,
        };

        let map = match value {
            Value::Null => return Ok(Self::new()),
            Value::Object(map) => map,
            other => return Err(malformed(format!("expected an object, got {other}"))),
        };

        let mut grid = Self::new();
        for (key, raw) in map {
            let names = split_names(key);
            let Value::Array(entries) = raw else {
                return Err(malformed(format!("values of `{key}` must be a list")));
            };

            let values = if names.len() == 1 {
                entries
                    .iter()
                    .map(|v| serde_json::from_value(v.clone()).map(|p| vec![p]))
                    .collect::<Result<Vec<_>, _>>()
            } else {
                entries
                    .iter()
                    .map(|v| match v {
                        Value::Array(items) => items
                            .iter()
                            .map(|item| serde_json::from_value(item.clone()))
                            .collect::<Result<Vec<ParameterValue>, _>>(),
                        // Leaves the arity check to `validate`.
                        other => serde_json::from_value(other.clone()).map(|p| vec![p]),
                    })
                    .collect::<Result<Vec<_>, _>>()
            };

            let values = values.map_err(|e| malformed(format!("`{key}`: {e}")))?;
            grid.axes.push(GridAxis { names, values });
        }

        grid.validate(component)?;
        Ok(grid)
    }

    /// All parameter names declared by the grid, in declaration order.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.axes
            .iter()
            .flat_map(|axis| axis.names.iter().map(String::as_str))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Number of parameter sets the grid expands to.
    pub fn size(&self) -> usize {
        self.axes.iter().map(|axis| axis.values.len()).product()
    }

    /// Check names are unique and non-empty and every tuple has the arity
    /// of its axis.
    pub fn validate(&self, component: &str) -> Result<(), ConfigError> {
        let malformed = |message: String| ConfigError::MalformedGrid {
            component: component.to_string(),
            message,
        };

        let mut seen = std::collections::BTreeSet::new();
        for axis in &self.axes {
            if axis.names.is_empty() || axis.names.iter().any(|n| n.is_empty()) {
                return Err(malformed("empty parameter name".to_string()));
            }
            for name in &axis.names {
                if !seen.insert(name.as_str()) {
                    return Err(malformed(format!("parameter `{name}` is declared twice")));
                }
            }
            for tuple in &axis.values {
                if tuple.len() != axis.names.len() {
                    return Err(malformed(format!(
                        "`{}` binds {} names but a value has {} entries",
                        axis.names.join(", "),
                        axis.names.len(),
                        tuple.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Expand into every parameter set. An empty grid yields one empty set.
    pub fn expand(&self, component: &str) -> Result<Vec<Parameters>, ConfigError> {
        self.validate(component)?;

        let mut result: Vec<Parameters> = vec![Parameters::new()];
        for axis in &self.axes {
            let mut next = Vec::with_capacity(result.len() * axis.values.len());
            for existing in &result {
                for tuple in &axis.values {
                    let mut combo = existing.clone();
                    for (name, value) in axis.names.iter().zip(tuple) {
                        combo.insert(name.clone(), value.clone());
                    }
                    next.push(combo);
                }
            }
            result = next;
        }

        Ok(result)
    }
}

fn split_names(names: &str) -> Vec<String> {
    names.split(',').map(|n| n.trim().to_string()).collect()
}
