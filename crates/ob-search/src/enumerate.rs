//! Expansion of datasets × objectives × solvers into trial tasks.

use ob_types::{ConfigError, PluginKind, PluginResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::filter::FilterSet;
use crate::registry::{Component, Registry};
use crate::task::{ComponentRef, ResourceProfile, TaskSpec};

/// Include and force patterns per component kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialFilters {
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub solvers: Vec<String>,
    /// Solvers whose trials ignore cached results. Implicitly included.
    #[serde(default)]
    pub forced_solvers: Vec<String>,
}

impl TrialFilters {
    pub fn with_datasets<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.datasets = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_objectives<S: Into<String>>(
        mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.objectives = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_solvers<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.solvers = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_forced_solvers<S: Into<String>>(
        mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.forced_solvers = patterns.into_iter().map(Into::into).collect();
        self
    }
}

/// A combination declined by one of its components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTrial {
    pub dataset: ComponentRef,
    pub objective: ComponentRef,
    pub solver: ComponentRef,
    pub reason: String,
}

impl SkippedTrial {
    pub fn name(&self) -> String {
        format!(
            "{} / {} / {}",
            self.dataset.display_name(),
            self.objective.display_name(),
            self.solver.display_name()
        )
    }
}

/// One enumerated combination.
#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    Run(TaskSpec),
    Skip(SkippedTrial),
}

impl Planned {
    pub fn name(&self) -> String {
        match self {
            Self::Run(task) => task.name(),
            Self::Skip(skipped) => skipped.name(),
        }
    }

    pub fn task(&self) -> Option<&TaskSpec> {
        match self {
            Self::Run(task) => Some(task),
            Self::Skip(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SolverEntry {
    reference: ComponentRef,
    forced: bool,
    resources: ResourceProfile,
}

/// Filtered, validated cross product of a registry's components.
///
/// All patterns and grids are checked on construction, so configuration
/// errors surface before any component is built. Iteration is lazy: the
/// dataset of a pair is loaded only when its first trial is requested.
#[derive(Debug, Clone)]
pub struct TrialEnumerator {
    registry: Arc<Registry>,
    datasets: Vec<ComponentRef>,
    objectives: Vec<ComponentRef>,
    solvers: Vec<SolverEntry>,
}

impl TrialEnumerator {
    pub fn new(registry: Arc<Registry>, filters: &TrialFilters) -> Result<Self, ConfigError> {
        let dataset_filter = checked_filter(&registry, PluginKind::Dataset, &filters.datasets)?;
        let objective_filter =
            checked_filter(&registry, PluginKind::Objective, &filters.objectives)?;
        let solver_filter = checked_filter(&registry, PluginKind::Solver, &filters.solvers)?;
        let forced = checked_filter(&registry, PluginKind::Solver, &filters.forced_solvers)?;

        let datasets = selected(registry.datasets(), &dataset_filter)?;
        let objectives = selected(registry.objectives(), &objective_filter)?;

        let mut solvers = Vec::new();
        for component in registry.solvers() {
            for reference in component.refs()? {
                let name = reference.display_name();
                let is_forced = forced.matches_any(&name);
                if !(solver_filter.is_match(&name) || is_forced) {
                    continue;
                }
                let resources = component
                    .resources()
                    .merged(&ResourceProfile::from_parameters(&reference.parameters));
                solvers.push(SolverEntry {
                    reference,
                    forced: is_forced,
                    resources,
                });
            }
        }

        Ok(Self {
            registry,
            datasets,
            objectives,
            solvers,
        })
    }

    /// A fresh pass over every combination, in dataset, objective, solver
    /// order. Each call restarts from the beginning.
    pub fn iter(&self) -> Trials<'_> {
        Trials {
            enumerator: self,
            dataset_idx: 0,
            objective_idx: 0,
            data: None,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            next_index: 0,
        }
    }

    pub fn enumerate(&self) -> Vec<Planned> {
        self.iter().collect()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Upper bound on the number of combinations, before skips.
    pub fn len_hint(&self) -> usize {
        self.datasets.len() * self.objectives.len() * self.solvers.len()
    }
}

fn checked_filter(
    registry: &Registry,
    kind: PluginKind,
    patterns: &[String],
) -> Result<FilterSet, ConfigError> {
    let filter = FilterSet::new(kind, patterns)?;
    if !filter.is_empty() {
        filter.validate(&registry.parametrized_names(kind)?, &registry.parameter_names(kind))?;
    }
    Ok(filter)
}

fn selected<T: ?Sized>(
    components: &[Component<T>],
    filter: &FilterSet,
) -> Result<Vec<ComponentRef>, ConfigError> {
    let mut refs = Vec::new();
    for component in components {
        refs.extend(
            component
                .refs()?
                .into_iter()
                .filter(|r| filter.is_match(&r.display_name())),
        );
    }
    Ok(refs)
}

/// Lazy iterator returned by [`TrialEnumerator::iter`].
pub struct Trials<'a> {
    enumerator: &'a TrialEnumerator,
    dataset_idx: usize,
    objective_idx: usize,
    data: Option<PluginResult<Value>>,
    pending: VecDeque<Planned>,
    seen: HashSet<String>,
    next_index: usize,
}

impl Iterator for Trials<'_> {
    type Item = Planned;

    fn next(&mut self) -> Option<Planned> {
        loop {
            if let Some(planned) = self.pending.pop_front() {
                return Some(planned);
            }

            let e = self.enumerator;
            if self.dataset_idx >= e.datasets.len() || e.objectives.is_empty() {
                return None;
            }

            let dataset = &e.datasets[self.dataset_idx];
            let objective = &e.objectives[self.objective_idx];
            if self.data.is_none() {
                self.data = Some(
                    e.registry
                        .build_dataset(dataset)
                        .and_then(|mut d| d.get_data()),
                );
            }
            self.plan_pair(dataset, objective);

            self.objective_idx += 1;
            if self.objective_idx == e.objectives.len() {
                self.objective_idx = 0;
                self.dataset_idx += 1;
                self.data = None;
            }
        }
    }
}

impl Trials<'_> {
    /// Queue every solver for one (dataset, objective) pair.
    ///
    /// Components that fail to build here are still planned: the failure is
    /// reproduced and reported when the trial runs.
    fn plan_pair(&mut self, dataset: &ComponentRef, objective: &ComponentRef) {
        let e = self.enumerator;

        let mut objective_skip = None;
        let mut objective_value = None;
        match &self.data {
            Some(Ok(data)) => match e.registry.build_objective(objective) {
                Ok(mut instance) => {
                    if let Some(reason) = instance.skip(data) {
                        objective_skip = Some(reason);
                    } else {
                        match instance.set_data(data) {
                            Ok(()) => objective_value = Some(instance.get_objective()),
                            Err(err) => debug!(
                                objective = %objective,
                                error = %err,
                                "objective failed while planning"
                            ),
                        }
                    }
                }
                Err(err) => {
                    debug!(objective = %objective, error = %err, "objective failed while planning")
                }
            },
            Some(Err(err)) => {
                debug!(dataset = %dataset, error = %err, "dataset failed while planning")
            }
            None => {}
        }

        for solver in &e.solvers {
            let skipped = |reason: String| {
                Planned::Skip(SkippedTrial {
                    dataset: dataset.clone(),
                    objective: objective.clone(),
                    solver: solver.reference.clone(),
                    reason,
                })
            };

            let name = format!("{dataset} / {objective} / {}", solver.reference);
            if !self.seen.insert(name) {
                continue;
            }

            if let Some(reason) = &objective_skip {
                self.pending.push_back(skipped(reason.clone()));
                continue;
            }

            if let Some(value) = &objective_value {
                match e.registry.build_solver(&solver.reference) {
                    Ok(instance) => {
                        if let Some(reason) = instance.skip(value) {
                            self.pending.push_back(skipped(reason));
                            continue;
                        }
                    }
                    Err(err) => debug!(
                        solver = %solver.reference,
                        error = %err,
                        "solver failed while planning"
                    ),
                }
            }

            self.pending.push_back(Planned::Run(TaskSpec {
                id: Uuid::new_v4(),
                index: self.next_index,
                dataset: dataset.clone(),
                objective: objective.clone(),
                solver: solver.reference.clone(),
                force: solver.forced,
                resources: solver.resources.clone(),
            }));
            self.next_index += 1;
        }
    }
}
