//! Serializable trial task descriptors and resource profiles.

use ob_types::{parametrized_name, ParameterValue, Parameters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Prefix marking solver parameters that configure the batch scheduler.
pub const RESOURCE_PARAM_PREFIX: &str = "slurm_";

/// Reference to one parametrized component, resolvable through a registry
/// on any worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    pub parameters: Parameters,
    /// Fingerprint of the component's implementation, if registered.
    pub version: Option<String>,
}

impl ComponentRef {
    pub fn new(name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            name: name.into(),
            parameters,
            version: None,
        }
    }

    pub fn display_name(&self) -> String {
        parametrized_name(&self.name, &self.parameters)
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Resource requirements of a batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Wall-time limit in seconds.
    pub wall_time_secs: Option<u64>,
    pub memory: Option<String>,
    pub partition: Option<String>,
    pub gpus: Option<u32>,
    /// Any other scheduler option, passed through verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ResourceProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wall_time(mut self, secs: u64) -> Self {
        self.wall_time_secs = Some(secs);
        self
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = Some(gpus);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(&key.into(), value.into());
        self
    }

    /// Overlay `other` on `self`: fields set in `other` win.
    pub fn merged(&self, other: &ResourceProfile) -> ResourceProfile {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        ResourceProfile {
            wall_time_secs: other.wall_time_secs.or(self.wall_time_secs),
            memory: other.memory.clone().or_else(|| self.memory.clone()),
            partition: other.partition.clone().or_else(|| self.partition.clone()),
            gpus: other.gpus.or(self.gpus),
            extra,
        }
    }

    /// Extract options from parameters named `slurm_<option>`.
    pub fn from_parameters(parameters: &Parameters) -> ResourceProfile {
        let mut profile = ResourceProfile::default();
        for (name, value) in parameters {
            if let Some(option) = name.strip_prefix(RESOURCE_PARAM_PREFIX) {
                profile.set(option, parameter_text(value));
            }
        }
        profile
    }

    /// Fill the wall time when nothing set it.
    pub fn or_wall_time(mut self, secs: u64) -> Self {
        self.wall_time_secs.get_or_insert(secs);
        self
    }

    fn set(&mut self, option: &str, value: String) {
        let option = option.strip_prefix(RESOURCE_PARAM_PREFIX).unwrap_or(option);
        match option {
            "time" | "wall_time" | "timeout_min" => {
                let minutes_scale = if option == "timeout_min" { 60 } else { 1 };
                match value.parse::<f64>() {
                    Ok(v) if v >= 0.0 => {
                        self.wall_time_secs = Some((v * minutes_scale as f64) as u64)
                    }
                    _ => {
                        self.extra.insert(option.to_string(), value);
                    }
                }
            }
            "mem" | "memory" => self.memory = Some(value),
            "partition" => self.partition = Some(value),
            "gpus" | "gres_gpu" => match value.parse::<u32>() {
                Ok(n) => self.gpus = Some(n),
                Err(_) => {
                    self.extra.insert(option.to_string(), value);
                }
            },
            _ => {
                self.extra.insert(option.to_string(), value);
            }
        }
    }
}

fn parameter_text(value: &ParameterValue) -> String {
    match value {
        ParameterValue::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(t) = self.wall_time_secs {
            parts.push(format!("time={t}s"));
        }
        if let Some(m) = &self.memory {
            parts.push(format!("mem={m}"));
        }
        if let Some(p) = &self.partition {
            parts.push(format!("partition={p}"));
        }
        if let Some(g) = self.gpus {
            parts.push(format!("gpus={g}"));
        }
        parts.extend(self.extra.iter().map(|(k, v)| format!("{k}={v}")));
        if parts.is_empty() {
            f.write_str("default")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

/// One trial to run: everything a worker needs to rebuild the components
/// and execute the trial with no shared memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: Uuid,
    /// Position in enumeration order.
    pub index: usize,
    pub dataset: ComponentRef,
    pub objective: ComponentRef,
    pub solver: ComponentRef,
    /// Recompute instead of reading cached points.
    pub force: bool,
    pub resources: ResourceProfile,
}

impl TaskSpec {
    /// `dataset / objective / solver` display name.
    pub fn name(&self) -> String {
        format!(
            "{} / {} / {}",
            self.dataset.display_name(),
            self.objective.display_name(),
            self.solver.display_name()
        )
    }
}
