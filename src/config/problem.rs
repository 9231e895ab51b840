//! Problem description: method blocks, model blocks and the top-level method.
//!
//! The description is parsed once (see [`ProblemDescription::from_json`]), validated,
//! and then shared read-only by every iterator factory through an `Arc`.

use super::options::SchedulerOptions;
use crate::error::SchedError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Leaf method names accepted in `method_names` lists.
pub const LEAF_METHOD_NAMES: [&str; 4] =
    ["pattern_search", "newton_cg", "random_sampling", "evolution_strategy"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDescription {
    pub top_method: String,
    pub methods: Vec<MethodBlock>,
    pub models: Vec<ModelBlock>,
}

impl ProblemDescription {
    pub fn from_json(text: &str) -> Result<Self, SchedError> {
        let description: Self = serde_json::from_str(text)?;
        description.validate()?;
        Ok(description)
    }

    /// Check identifier uniqueness and that every pointer resolves.
    pub fn validate(&self) -> Result<(), SchedError> {
        let mut seen = HashSet::new();
        for id in self.methods.iter().map(|m| &m.id).chain(self.models.iter().map(|m| &m.id)) {
            if !seen.insert(id.as_str()) {
                return Err(SchedError::Spec(format!("identifier '{id}' is declared twice")));
            }
        }
        self.method(&self.top_method)?;
        for method in &self.methods {
            if let Some(model) = &method.model_pointer {
                self.model(model)?;
            }
        }
        for model in &self.models {
            model.validate()?;
        }
        Ok(())
    }

    pub fn method(&self, id: &str) -> Result<&MethodBlock, SchedError> {
        self.methods
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| SchedError::Spec(format!("no method block with id '{id}'")))
    }

    pub fn model(&self, id: &str) -> Result<&ModelBlock, SchedError> {
        self.models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| SchedError::Spec(format!("no model block with id '{id}'")))
    }

    /// Model a method runs on: its own pointer, else the fallback, else the only model.
    pub fn resolve_model(&self, own: Option<&str>, fallback: Option<&str>) -> Result<&ModelBlock, SchedError> {
        match own.or(fallback) {
            Some(id) => self.model(id),
            None => match self.models.as_slice() {
                [only] => Ok(only),
                _ => Err(SchedError::Spec(
                    "method has no model_pointer and the description does not declare exactly one model"
                        .to_string(),
                )),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBlock {
    pub id: String,
    #[serde(default)]
    pub model_pointer: Option<String>,
    #[serde(default)]
    pub scheduling: SchedulerOptions,
    pub method: MethodKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MethodKind {
    PatternSearch(PatternSearchSpec),
    NewtonCg(NewtonSpec),
    RandomSampling(SamplingSpec),
    EvolutionStrategy(EvolutionSpec),
    HybridSequential(SeqHybridSpec),
    HybridEmbedded(EmbedHybridSpec),
    HybridCollaborative(HybridSpec),
    MultiStart(MultiStartSpec),
    ParetoSet(ParetoSetSpec),
}

impl MethodKind {
    /// Default-configured leaf method for a `method_names` entry.
    pub fn from_leaf_name(name: &str) -> Result<Self, SchedError> {
        match name {
            "pattern_search" => Ok(MethodKind::PatternSearch(PatternSearchSpec::default())),
            "newton_cg" => Ok(MethodKind::NewtonCg(NewtonSpec::default())),
            "random_sampling" => Ok(MethodKind::RandomSampling(SamplingSpec::default())),
            "evolution_strategy" => Ok(MethodKind::EvolutionStrategy(EvolutionSpec::default())),
            other => Err(SchedError::Spec(format!(
                "unknown method name '{other}', expected one of {LEAF_METHOD_NAMES:?}"
            ))),
        }
    }

    pub fn is_meta(&self) -> bool {
        matches!(
            self,
            MethodKind::HybridSequential(_)
                | MethodKind::HybridEmbedded(_)
                | MethodKind::HybridCollaborative(_)
                | MethodKind::MultiStart(_)
                | MethodKind::ParetoSet(_)
        )
    }
}

/// Where a sub-iterator comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubMethod {
    /// A declared method block, built with its own settings and model.
    Pointer(String),
    /// A leaf method by name with default settings, bound to `model`.
    Named { name: String, model: String },
}

impl std::fmt::Display for SubMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubMethod::Pointer(id) => write!(f, "method '{id}'"),
            SubMethod::Named { name, model } => write!(f, "{name} on model '{model}'"),
        }
    }
}

/// `method_pointers` XOR `method_names`, with optional `model_pointers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSpec {
    pub method_pointers: Vec<String>,
    pub method_names: Vec<String>,
    pub model_pointers: Vec<String>,
}

impl HybridSpec {
    pub fn from_pointers<S: Into<String>>(pointers: impl IntoIterator<Item = S>) -> Self {
        Self { method_pointers: pointers.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    pub fn from_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self { method_names: names.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    pub fn with_models<S: Into<String>>(mut self, models: impl IntoIterator<Item = S>) -> Self {
        self.model_pointers = models.into_iter().map(Into::into).collect();
        self
    }

    /// Check the method lists and produce one [`SubMethod`] per entry.
    pub fn resolve(
        &self,
        meta_model: Option<&str>,
        description: &ProblemDescription,
    ) -> Result<Vec<SubMethod>, SchedError> {
        match (self.method_pointers.is_empty(), self.method_names.is_empty()) {
            (false, false) => Err(SchedError::Spec(
                "method_pointers and method_names are mutually exclusive".to_string(),
            )),
            (true, true) => Err(SchedError::Spec(
                "one of method_pointers or method_names must be non-empty".to_string(),
            )),
            (false, true) => {
                if !self.model_pointers.is_empty() {
                    warn!("model_pointers are ignored when method_pointers are given");
                }
                self.method_pointers
                    .iter()
                    .map(|id| {
                        description.method(id)?;
                        Ok(SubMethod::Pointer(id.clone()))
                    })
                    .collect()
            }
            (true, false) => {
                let n = self.method_names.len();
                let models = &self.model_pointers;
                if !(models.is_empty() || models.len() == 1 || models.len() == n) {
                    return Err(SchedError::Spec(format!(
                        "{} model_pointers given for {n} method_names; expected 0, 1 or {n}",
                        models.len()
                    )));
                }
                self.method_names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| {
                        MethodKind::from_leaf_name(name)?;
                        let own = match models.len() {
                            0 => None,
                            1 => Some(models[0].as_str()),
                            _ => Some(models[i].as_str()),
                        };
                        let model = description.resolve_model(own, meta_model)?;
                        Ok(SubMethod::Named { name: name.clone(), model: model.id.clone() })
                    })
                    .collect()
            }
        }
    }
}

/// One sub-method given either by pointer or by name.
pub fn resolve_single(
    pointer: Option<&str>,
    name: Option<&str>,
    model: Option<&str>,
    meta_model: Option<&str>,
    description: &ProblemDescription,
) -> Result<SubMethod, SchedError> {
    let spec = HybridSpec {
        method_pointers: pointer.map(str::to_string).into_iter().collect(),
        method_names: name.map(str::to_string).into_iter().collect(),
        model_pointers: model.map(str::to_string).into_iter().collect(),
    };
    let mut resolved = spec.resolve(meta_model, description)?;
    resolved
        .pop()
        .ok_or_else(|| SchedError::Spec("no sub-method given".to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSearchSpec {
    pub initial_step: f64,
    pub min_step: f64,
    pub contraction: f64,
    pub max_iterations: usize,
}

impl Default for PatternSearchSpec {
    fn default() -> Self {
        Self { initial_step: 0.25, min_step: 1e-6, contraction: 0.5, max_iterations: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonSpec {
    pub max_iterations: usize,
    pub gradient_tolerance: f64,
    /// Relative finite-difference step.
    pub fd_step: f64,
}

impl Default for NewtonSpec {
    fn default() -> Self {
        Self { max_iterations: 50, gradient_tolerance: 1e-6, fd_step: 1e-5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSpec {
    pub samples: usize,
    pub seed: u64,
    /// Number of best samples returned; `None` lets the sampler decide.
    pub final_solutions: Option<usize>,
}

impl Default for SamplingSpec {
    fn default() -> Self {
        Self { samples: 64, seed: 1, final_solutions: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSpec {
    /// Parents kept per generation (μ).
    pub population: usize,
    /// Offspring per generation (λ).
    pub offspring: usize,
    pub generations: usize,
    /// Mutation step relative to the bound range.
    pub sigma: f64,
    pub seed: u64,
}

impl Default for EvolutionSpec {
    fn default() -> Self {
        Self { population: 6, offspring: 12, generations: 40, sigma: 0.2, seed: 7 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeqHybridSpec {
    #[serde(flatten)]
    pub methods: HybridSpec,
    #[serde(default)]
    pub adaptive: bool,
    #[serde(default = "SeqHybridSpec::default_threshold")]
    pub progress_threshold: f64,
    #[serde(default = "SeqHybridSpec::default_batch")]
    pub batch_iterations: usize,
    #[serde(default = "SeqHybridSpec::default_cycles")]
    pub max_adaptive_cycles: usize,
}

impl SeqHybridSpec {
    fn default_threshold() -> f64 {
        0.1
    }
    fn default_batch() -> usize {
        10
    }
    fn default_cycles() -> usize {
        5
    }

    pub fn new(methods: HybridSpec) -> Self {
        Self {
            methods,
            adaptive: false,
            progress_threshold: Self::default_threshold(),
            batch_iterations: Self::default_batch(),
            max_adaptive_cycles: Self::default_cycles(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedHybridSpec {
    pub global_method_pointer: Option<String>,
    pub global_method_name: Option<String>,
    pub global_model_pointer: Option<String>,
    pub local_method_pointer: Option<String>,
    pub local_method_name: Option<String>,
    pub local_model_pointer: Option<String>,
    pub local_search_probability: f64,
}

/// Sub-method of a concurrent meta-iterator: `method_pointer` XOR `method_name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentSubMethod {
    pub method_pointer: Option<String>,
    pub method_name: Option<String>,
    pub model_pointer: Option<String>,
}

impl ConcurrentSubMethod {
    pub fn resolve(&self, meta_model: Option<&str>, description: &ProblemDescription) -> Result<SubMethod, SchedError> {
        resolve_single(
            self.method_pointer.as_deref(),
            self.method_name.as_deref(),
            self.model_pointer.as_deref(),
            meta_model,
            description,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiStartSpec {
    #[serde(flatten)]
    pub sub_method: ConcurrentSubMethod,
    #[serde(default)]
    pub starting_points: Vec<Vec<f64>>,
    #[serde(default)]
    pub random_starts: usize,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParetoSetSpec {
    #[serde(flatten)]
    pub sub_method: ConcurrentSubMethod,
    #[serde(default)]
    pub weight_sets: Vec<Vec<f64>>,
    #[serde(default)]
    pub random_weight_sets: usize,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBlock {
    pub id: String,
    pub function: TestFunction,
    pub lower_bounds: Vec<f64>,
    pub upper_bounds: Vec<f64>,
    pub initial_point: Vec<f64>,
    /// Primary-response weights reducing several functions to one objective.
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    #[serde(default = "ModelBlock::one")]
    pub processors_per_evaluation: usize,
    #[serde(default = "ModelBlock::one")]
    pub evaluation_concurrency: usize,
}

impl ModelBlock {
    fn one() -> usize {
        1
    }

    pub fn new(id: impl Into<String>, function: TestFunction, lower: Vec<f64>, upper: Vec<f64>, initial: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            function,
            lower_bounds: lower,
            upper_bounds: upper,
            initial_point: initial,
            weights: None,
            processors_per_evaluation: 1,
            evaluation_concurrency: 1,
        }
    }

    pub fn num_variables(&self) -> usize {
        self.initial_point.len()
    }

    pub fn num_functions(&self) -> usize {
        self.function.num_functions()
    }

    pub fn validate(&self) -> Result<(), SchedError> {
        let n = self.num_variables();
        if n == 0 {
            return Err(SchedError::Spec(format!("model '{}' has no variables", self.id)));
        }
        if self.lower_bounds.len() != n || self.upper_bounds.len() != n {
            return Err(SchedError::Spec(format!(
                "model '{}': bounds must have one entry per variable ({n})",
                self.id
            )));
        }
        if self.lower_bounds.iter().zip(&self.upper_bounds).any(|(l, u)| l > u) {
            return Err(SchedError::Spec(format!("model '{}': lower bound above upper bound", self.id)));
        }
        if let Some(w) = &self.weights {
            if w.len() != self.num_functions() {
                return Err(SchedError::Spec(format!(
                    "model '{}': {} weights for {} functions",
                    self.id,
                    w.len(),
                    self.num_functions()
                )));
            }
        }
        if self.processors_per_evaluation == 0 || self.evaluation_concurrency == 0 {
            return Err(SchedError::Spec(format!("model '{}': processor counts must be positive", self.id)));
        }
        self.function.validate(&self.id, n)
    }
}

/// Analytic response functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestFunction {
    /// ½ (x − c)ᵀ H (x − c), H given row by row.
    Quadratic { hessian: Vec<Vec<f64>>, center: Vec<f64> },
    Rosenbrock,
    Rastrigin,
    /// One function ‖x − cₖ‖² per center.
    Paraboloids { centers: Vec<Vec<f64>> },
}

impl TestFunction {
    pub fn num_functions(&self) -> usize {
        match self {
            TestFunction::Paraboloids { centers } => centers.len(),
            _ => 1,
        }
    }

    fn validate(&self, model: &str, n: usize) -> Result<(), SchedError> {
        let ok = match self {
            TestFunction::Quadratic { hessian, center } => {
                center.len() == n && hessian.len() == n && hessian.iter().all(|row| row.len() == n)
            }
            TestFunction::Rosenbrock => n >= 2,
            TestFunction::Rastrigin => true,
            TestFunction::Paraboloids { centers } => {
                !centers.is_empty() && centers.iter().all(|c| c.len() == n)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(SchedError::Spec(format!("model '{model}': function data does not match {n} variables")))
        }
    }
}
