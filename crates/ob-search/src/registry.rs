//! Registered datasets, objectives and solvers.
//!
//! The registry is the boundary with the plugin layer: each component is a
//! name, a parameter grid and a factory building an instance for one
//! parameter set. Workers hold their own registry and rebuild components
//! from a [`TaskSpec`](crate::TaskSpec), so nothing but the task crosses a
//! process boundary.

use ob_types::{
    parametrized_name, ConfigError, Dataset, Objective, Parameters, PluginError, PluginKind,
    PluginResult, Solver,
};
use std::fmt;
use std::sync::Arc;

use crate::grid::ParameterGrid;
use crate::task::{ComponentRef, ResourceProfile};

pub type Factory<T> = Arc<dyn Fn(&Parameters) -> PluginResult<Box<T>> + Send + Sync>;

/// A named, parametrizable component and the factory that builds it.
pub struct Component<T: ?Sized> {
    name: String,
    grid: ParameterGrid,
    version: Option<String>,
    resources: ResourceProfile,
    factory: Factory<T>,
}

impl<T: ?Sized> Clone for Component<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            grid: self.grid.clone(),
            version: self.version.clone(),
            resources: self.resources.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Component<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("grid", &self.grid)
            .field("version", &self.version)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> Component<T> {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Parameters) -> PluginResult<Box<T>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            grid: ParameterGrid::new(),
            version: None,
            resources: ResourceProfile::default(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_grid(mut self, grid: ParameterGrid) -> Self {
        self.grid = grid;
        self
    }

    /// Fingerprint of the implementation; changing it invalidates cached
    /// results of this component.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Static batch resource profile, used for solvers.
    pub fn with_resources(mut self, resources: ResourceProfile) -> Self {
        self.resources = resources;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid(&self) -> &ParameterGrid {
        &self.grid
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn resources(&self) -> &ResourceProfile {
        &self.resources
    }

    /// One reference per parameter set of the grid.
    pub fn refs(&self) -> Result<Vec<ComponentRef>, ConfigError> {
        Ok(self
            .grid
            .expand(&self.name)?
            .into_iter()
            .map(|parameters| ComponentRef {
                name: self.name.clone(),
                parameters,
                version: self.version.clone(),
            })
            .collect())
    }

    pub fn build(&self, parameters: &Parameters) -> PluginResult<Box<T>> {
        (self.factory)(parameters)
            .map_err(|e| e.in_component(&parametrized_name(&self.name, parameters)))
    }
}

pub type DatasetComponent = Component<dyn Dataset>;
pub type ObjectiveComponent = Component<dyn Objective>;
pub type SolverComponent = Component<dyn Solver>;

/// All components of a benchmark, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    datasets: Vec<DatasetComponent>,
    objectives: Vec<ObjectiveComponent>,
    solvers: Vec<SolverComponent>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, component: DatasetComponent) -> Self {
        self.datasets.push(component);
        self
    }

    pub fn with_objective(mut self, component: ObjectiveComponent) -> Self {
        self.objectives.push(component);
        self
    }

    pub fn with_solver(mut self, component: SolverComponent) -> Self {
        self.solvers.push(component);
        self
    }

    pub fn datasets(&self) -> &[DatasetComponent] {
        &self.datasets
    }

    pub fn objectives(&self) -> &[ObjectiveComponent] {
        &self.objectives
    }

    pub fn solvers(&self) -> &[SolverComponent] {
        &self.solvers
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetComponent, ConfigError> {
        find(&self.datasets, PluginKind::Dataset, name)
    }

    pub fn objective(&self, name: &str) -> Result<&ObjectiveComponent, ConfigError> {
        find(&self.objectives, PluginKind::Objective, name)
    }

    pub fn solver(&self, name: &str) -> Result<&SolverComponent, ConfigError> {
        find(&self.solvers, PluginKind::Solver, name)
    }

    /// Parametrized names of every instance of `kind`.
    pub fn parametrized_names(&self, kind: PluginKind) -> Result<Vec<String>, ConfigError> {
        let refs = match kind {
            PluginKind::Dataset => all_refs(&self.datasets)?,
            PluginKind::Objective => all_refs(&self.objectives)?,
            PluginKind::Solver => all_refs(&self.solvers)?,
        };
        Ok(refs.iter().map(ComponentRef::display_name).collect())
    }

    /// Sorted parameter names declared by any component of `kind`.
    pub fn parameter_names(&self, kind: PluginKind) -> Vec<String> {
        let grids: Vec<&ParameterGrid> = match kind {
            PluginKind::Dataset => self.datasets.iter().map(Component::grid).collect(),
            PluginKind::Objective => self.objectives.iter().map(Component::grid).collect(),
            PluginKind::Solver => self.solvers.iter().map(Component::grid).collect(),
        };
        let mut names: Vec<String> = grids
            .into_iter()
            .flat_map(|g| g.parameter_names().into_iter().map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn build_dataset(&self, r: &ComponentRef) -> PluginResult<Box<dyn Dataset>> {
        self.dataset(&r.name)
            .map_err(|e| unknown(PluginKind::Dataset, r, e))?
            .build(&r.parameters)
    }

    pub fn build_objective(&self, r: &ComponentRef) -> PluginResult<Box<dyn Objective>> {
        self.objective(&r.name)
            .map_err(|e| unknown(PluginKind::Objective, r, e))?
            .build(&r.parameters)
    }

    pub fn build_solver(&self, r: &ComponentRef) -> PluginResult<Box<dyn Solver>> {
        self.solver(&r.name)
            .map_err(|e| unknown(PluginKind::Solver, r, e))?
            .build(&r.parameters)
    }
}

fn find<'a, T: ?Sized>(
    components: &'a [Component<T>],
    kind: PluginKind,
    name: &str,
) -> Result<&'a Component<T>, ConfigError> {
    components
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| ConfigError::UnknownComponent {
            kind,
            name: name.to_string(),
        })
}

fn all_refs<T: ?Sized>(components: &[Component<T>]) -> Result<Vec<ComponentRef>, ConfigError> {
    let mut refs = Vec::new();
    for c in components {
        refs.extend(c.refs()?);
    }
    Ok(refs)
}

/// A worker asked to build a component its registry does not know.
fn unknown(kind: PluginKind, r: &ComponentRef, error: ConfigError) -> PluginError {
    PluginError::Build {
        origin: kind,
        component: r.display_name(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ob_types::{Metrics, RunBudget};
    use serde_json::{json, Value};

    struct Noop;

    impl Solver for Noop {
        fn set_objective(&mut self, _objective: &Value) -> PluginResult<()> {
            Ok(())
        }

        fn run(&mut self, _budget: RunBudget<'_>) -> PluginResult<()> {
            Ok(())
        }

        fn get_result(&self) -> PluginResult<Value> {
            Ok(json!({}))
        }
    }

    struct Constant;

    impl Objective for Constant {
        fn set_data(&mut self, _data: &Value) -> PluginResult<()> {
            Ok(())
        }

        fn get_objective(&self) -> Value {
            Value::Null
        }

        fn evaluate(&self, _candidate: &Value) -> PluginResult<Metrics> {
            Ok(Metrics::new())
        }

        fn get_baseline_result(&self) -> Value {
            Value::Null
        }
    }

    fn registry() -> Registry {
        Registry::new()
            .with_objective(Component::new("constant", |_: &Parameters| {
                Ok(Box::new(Constant) as Box<dyn Objective>)
            }))
            .with_solver(
                Component::new("noop", |_: &Parameters| Ok(Box::new(Noop) as Box<dyn Solver>))
                    .with_grid(ParameterGrid::new().add("step", vec![0.1, 1.0]))
                    .with_version("v2"),
            )
            .with_solver(Component::new("broken", |_: &Parameters| {
                Err::<Box<dyn Solver>, _>(PluginError::solver("missing dependency"))
            }))
    }

    #[test]
    fn names_and_parameters_per_kind() {
        let registry = registry();
        assert_eq!(
            registry.parametrized_names(PluginKind::Solver).unwrap(),
            vec!["noop[step=0.1]", "noop[step=1]", "broken"]
        );
        assert_eq!(registry.parameter_names(PluginKind::Solver), vec!["step"]);
        assert!(registry.parameter_names(PluginKind::Objective).is_empty());
    }

    #[test]
    fn refs_carry_versions() {
        let registry = registry();
        let refs = registry.solver("noop").unwrap().refs().unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.version.as_deref() == Some("v2")));
    }

    #[test]
    fn build_errors_name_the_component() {
        let registry = registry();
        let err = registry
            .build_solver(&ComponentRef::new("broken", Parameters::new()))
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "solver broken failed: missing dependency");

        let err = registry
            .build_solver(&ComponentRef::new("lbfgs", Parameters::new()))
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Build { origin: PluginKind::Solver, .. }));
        assert!(registry.solver("lbfgs").is_err());
    }
}
