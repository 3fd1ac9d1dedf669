//! Pipeline definitions for scan profiles.
//!
//! A profile names a set of stage kinds and the dependency edges between
//! them. Profiles are validated once at load time into immutable
//! [`PipelineDefinition`]s that every scan of that profile shares.
//!
//! ## Example
//!
//! ```
//! use reconflow::pipeline::{PipelineBuilder, PipelineDefinition, PipelineRegistry};
//! use reconflow::stage::StageKind;
//!
//! let graph = PipelineBuilder::new(vec![StageKind::EnumerateSubdomains, StageKind::ProbeLiveness])
//!     .edges([(StageKind::EnumerateSubdomains, StageKind::ProbeLiveness)])
//!     .build()
//!     .unwrap();
//!
//! let mut registry = PipelineRegistry::new();
//! registry.register(PipelineDefinition::new("quick", graph));
//!
//! let quick = registry.resolve("quick").unwrap();
//! assert_eq!(quick.graph().compute_waves().len(), 2);
//! ```

mod builder;
mod definition;

pub use builder::{PipelineBuilder, StageGraph};
pub use definition::{
    PipelineDefinition, PipelineRegistry, ProfileSpec, StagePolicy, builtin_profiles,
};
