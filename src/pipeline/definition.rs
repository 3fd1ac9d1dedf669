//! Profile definitions and the registry that resolves them.

use crate::errors::{PipelineError, SubmitError};
use crate::pipeline::builder::{PipelineBuilder, StageGraph};
use crate::stage::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Per-stage execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            max_attempts: 3,
        }
    }
}

/// Raw profile as written in configuration: stage names plus edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSpec {
    /// Stage kinds in this profile
    #[serde(default)]
    pub stages: Vec<String>,
    /// Dependency edges as `[from, to]` pairs
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

impl ProfileSpec {
    pub fn new(stages: &[StageKind], edges: &[(StageKind, StageKind)]) -> Self {
        Self {
            stages: stages.iter().map(|s| s.to_string()).collect(),
            edges: edges
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    fn parse_stage(name: &str) -> Result<StageKind, PipelineError> {
        StageKind::parse(name).ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// Validate names and build the dependency graph.
    pub fn to_graph(&self) -> Result<StageGraph, PipelineError> {
        let stages = self
            .stages
            .iter()
            .map(|s| Self::parse_stage(s))
            .collect::<Result<Vec<_>, _>>()?;
        let edges = self
            .edges
            .iter()
            .map(|(a, b)| Ok((Self::parse_stage(a)?, Self::parse_stage(b)?)))
            .collect::<Result<Vec<_>, PipelineError>>()?;
        PipelineBuilder::new(stages).edges(edges).build()
    }
}

/// Immutable template for one profile, shared by every scan of that profile.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    name: String,
    graph: StageGraph,
    policies: HashMap<StageKind, StagePolicy>,
}

impl PipelineDefinition {
    pub fn new(name: &str, graph: StageGraph) -> Self {
        Self {
            name: name.to_string(),
            graph,
            policies: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, kind: StageKind, policy: StagePolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn stages(&self) -> &[StageKind] {
        self.graph.stages()
    }

    pub fn policy(&self, kind: StageKind) -> StagePolicy {
        self.policies.get(&kind).copied().unwrap_or_default()
    }
}

/// Profiles available when configuration defines none.
pub fn builtin_profiles() -> BTreeMap<String, ProfileSpec> {
    use StageKind::*;

    let mut profiles = BTreeMap::new();
    profiles.insert(
        "subdomain".to_string(),
        ProfileSpec::new(&[EnumerateSubdomains], &[]),
    );
    profiles.insert(
        "quick".to_string(),
        ProfileSpec::new(
            &[EnumerateSubdomains, ProbeLiveness],
            &[(EnumerateSubdomains, ProbeLiveness)],
        ),
    );
    profiles.insert(
        "probing".to_string(),
        ProfileSpec::new(&[ProbeLiveness, ScanPorts], &[]),
    );
    profiles.insert(
        "standard".to_string(),
        ProfileSpec::new(
            &[EnumerateSubdomains, ProbeLiveness, ScanPorts, HarvestUrls],
            &[
                (EnumerateSubdomains, ProbeLiveness),
                (EnumerateSubdomains, ScanPorts),
                (ProbeLiveness, HarvestUrls),
            ],
        ),
    );
    profiles.insert(
        "full".to_string(),
        ProfileSpec::new(
            &StageKind::ALL,
            &[
                (EnumerateSubdomains, ProbeLiveness),
                (EnumerateSubdomains, ScanPorts),
                (ProbeLiveness, Crawl),
                (ProbeLiveness, DetectVulnerabilities),
                (ProbeLiveness, HarvestUrls),
            ],
        ),
    );
    profiles
}

/// Registry of pipeline definitions keyed by profile name.
///
/// Invalid profiles are kept alongside their validation error so that only
/// submits naming them fail.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    profiles: BTreeMap<String, Result<Arc<PipelineDefinition>, PipelineError>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate every profile spec and register the results.
    pub fn load<F>(specs: &BTreeMap<String, ProfileSpec>, policy_for: F) -> Self
    where
        F: Fn(StageKind) -> StagePolicy,
    {
        let mut registry = Self::new();
        for (name, spec) in specs {
            let entry = spec.to_graph().map(|graph| {
                let policies = graph
                    .stages()
                    .iter()
                    .map(|&kind| (kind, policy_for(kind)))
                    .collect();
                Arc::new(PipelineDefinition {
                    name: name.clone(),
                    graph,
                    policies,
                })
            });
            if let Err(ref e) = entry {
                tracing::warn!(profile = %name, error = %e, "Rejected invalid pipeline profile");
            }
            registry.profiles.insert(name.clone(), entry);
        }
        registry
    }

    pub fn register(&mut self, definition: PipelineDefinition) {
        self.profiles
            .insert(definition.name.clone(), Ok(Arc::new(definition)));
    }

    /// Resolve a profile name to its definition.
    pub fn resolve(&self, profile: &str) -> Result<Arc<PipelineDefinition>, SubmitError> {
        match self.profiles.get(profile) {
            None => Err(SubmitError::UnknownProfile(profile.to_string())),
            Some(Err(source)) => Err(SubmitError::InvalidPipeline {
                profile: profile.to_string(),
                source: source.clone(),
            }),
            Some(Ok(def)) => Ok(def.clone()),
        }
    }

    /// Names of every registered profile, valid or not.
    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    /// Profiles that failed validation, with their errors.
    pub fn invalid_profiles(&self) -> Vec<(&str, &PipelineError)> {
        self.profiles
            .iter()
            .filter_map(|(name, entry)| entry.as_ref().err().map(|e| (name.as_str(), e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PipelineRegistry {
        let mut specs = builtin_profiles();
        specs.insert(
            "loop".to_string(),
            ProfileSpec {
                stages: vec!["crawl".into(), "harvest-urls".into()],
                edges: vec![
                    ("crawl".into(), "harvest-urls".into()),
                    ("harvest-urls".into(), "crawl".into()),
                ],
            },
        );
        PipelineRegistry::load(&specs, |kind| StagePolicy {
            timeout: Duration::from_secs(30),
            max_attempts: if kind == StageKind::EnumerateSubdomains { 2 } else { 3 },
        })
    }

    #[test]
    fn test_resolve_builtin_quick() {
        let def = registry().resolve("quick").unwrap();
        assert_eq!(
            def.stages(),
            &[StageKind::EnumerateSubdomains, StageKind::ProbeLiveness]
        );
        assert_eq!(
            def.graph().dependencies(StageKind::ProbeLiveness),
            vec![StageKind::EnumerateSubdomains]
        );
        assert_eq!(def.policy(StageKind::EnumerateSubdomains).max_attempts, 2);
        assert_eq!(def.policy(StageKind::ProbeLiveness).max_attempts, 3);
    }

    #[test]
    fn test_unknown_profile() {
        let err = registry().resolve("deep-space").unwrap_err();
        assert!(matches!(err, SubmitError::UnknownProfile(p) if p == "deep-space"));
    }

    #[test]
    fn test_cyclic_profile_surfaces_invalid_pipeline() {
        let reg = registry();
        let err = reg.resolve("loop").unwrap_err();
        assert!(matches!(
            err,
            SubmitError::InvalidPipeline {
                source: PipelineError::Cycle(_),
                ..
            }
        ));
        // Other profiles stay usable
        assert!(reg.resolve("full").is_ok());
        assert_eq!(reg.invalid_profiles().len(), 1);
    }

    #[test]
    fn test_unknown_stage_name_rejected() {
        let spec = ProfileSpec {
            stages: vec!["enumerate-subdomains".into(), "teleport".into()],
            edges: vec![],
        };
        assert_eq!(
            spec.to_graph().unwrap_err(),
            PipelineError::UnknownStage("teleport".into())
        );
    }

    #[test]
    fn test_builtin_profiles_are_valid() {
        for (name, spec) in builtin_profiles() {
            assert!(spec.to_graph().is_ok(), "builtin profile {name} invalid");
        }
    }
}
