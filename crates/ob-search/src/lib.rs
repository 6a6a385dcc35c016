//! Component registry, parameter grids and trial enumeration.

pub mod enumerate;
pub mod filter;
pub mod grid;
pub mod registry;
pub mod task;

pub use enumerate::{Planned, SkippedTrial, TrialEnumerator, TrialFilters, Trials};
pub use filter::{FilterSet, NameFilter};
pub use grid::{GridAxis, ParameterGrid};
pub use registry::{
    Component, DatasetComponent, Factory, ObjectiveComponent, Registry, SolverComponent,
};
pub use task::{ComponentRef, ResourceProfile, TaskSpec, RESOURCE_PARAM_PREFIX};
