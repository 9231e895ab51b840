//! Top-level driver.
//!
//! An [`Environment`] owns the process tree of one process and the top method of the
//! problem description. [`Environment::execute`] walks the top method through
//! init/set/run/free on the world communicator. Any failure is logged on the process
//! where it originated and aborts the whole tree, so processes blocked in a receive
//! return [`CommError::Aborted`](crate::error::CommError::Aborted) instead of hanging.

use crate::config::ProblemDescription;
use crate::context::{Construction, IteratorFactory};
use crate::error::SchedError;
use crate::iterator::{Algorithm, AnyIterator};
use crate::parallel::{Comm, Communicator, ProcessTree};
use crate::scheduler::{best_of, ParamResponsePair};
use log::{error, info};
use std::sync::Arc;

/// What one process holds after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub rank: usize,
    /// Final solutions of the top method. Meta-iterators share them with every process;
    /// a leaf top method reports them on rank 0 only.
    pub final_solutions: Vec<ParamResponsePair>,
    pub best: Option<ParamResponsePair>,
    /// Evaluations performed by this process.
    pub evaluations: usize,
    /// Evaluable model instances this process built.
    pub instantiated_models: usize,
}

pub struct Environment {
    tree: ProcessTree,
    top: AnyIterator,
}

impl Environment {
    pub fn new(description: Arc<ProblemDescription>, world: impl Into<Communicator>) -> Result<Self, SchedError> {
        description.validate()?;
        let top_method = description.top_method.clone();
        let factory = IteratorFactory::new(description);
        let top = factory.build_method(&top_method, Construction::Full)?;
        Ok(Self { tree: ProcessTree::new(world.into()), top })
    }

    pub fn from_json(text: &str, world: impl Into<Communicator>) -> Result<Self, SchedError> {
        Self::new(Arc::new(ProblemDescription::from_json(text)?), world)
    }

    pub fn top(&self) -> &dyn Algorithm {
        self.top.as_algorithm()
    }

    pub fn tree(&self) -> &ProcessTree {
        &self.tree
    }

    fn rank(&self) -> usize {
        self.tree.world().map_or(0, Comm::rank)
    }

    /// Run the top method once. On failure the process tree is aborted and the error
    /// returned.
    pub fn execute(&mut self) -> Result<RunSummary, SchedError> {
        match self.drive() {
            Ok((evaluations, instantiated_models)) => {
                let top = self.top.as_algorithm();
                let final_solutions = top.final_solutions().to_vec();
                let summary = RunSummary {
                    rank: self.rank(),
                    best: best_of(&final_solutions).cloned(),
                    final_solutions,
                    evaluations,
                    instantiated_models,
                };
                if summary.rank == 0 {
                    info!(
                        "{} finished: {} final solution(s), best objective {:.6e}",
                        top.method_name(),
                        summary.final_solutions.len(),
                        summary.best.as_ref().map_or(f64::NAN, ParamResponsePair::objective)
                    );
                }
                Ok(summary)
            }
            Err(err) => {
                if !err.is_abort() {
                    error!("rank {}: {err}", self.rank());
                }
                if let Some(world) = self.tree.world() {
                    world.abort(1);
                }
                Err(err)
            }
        }
    }

    /// Full lifecycle; returns evaluation and model counts taken before the sub-iterators
    /// are released.
    fn drive(&mut self) -> Result<(usize, usize), SchedError> {
        let top = self.top.as_algorithm_mut();
        top.init_communicators(&mut self.tree, ProcessTree::ROOT)?;
        top.set_communicators(&self.tree, ProcessTree::ROOT)?;
        top.run()?;
        let counts = (top.evaluations(), top.instantiated_models());
        top.free_communicators(&mut self.tree, ProcessTree::ROOT)?;
        Ok(counts)
    }
}

/// Run `description` on `processes` thread ranks and collect every rank's summary.
///
/// When ranks fail, the error of the rank that caused the abort is returned rather than
/// the `Aborted` errors of the ranks it woke.
#[cfg(feature = "rayon")]
pub fn run_local(description: Arc<ProblemDescription>, processes: usize) -> Result<Vec<RunSummary>, SchedError> {
    use crate::parallel::LocalUniverse;

    let outcomes = LocalUniverse::new(processes)
        .run(|comm| Environment::new(Arc::clone(&description), comm).and_then(|mut env| env.execute()))?;
    let mut summaries = Vec::with_capacity(outcomes.len());
    let mut abort = None;
    for outcome in outcomes {
        match outcome {
            Ok(summary) => summaries.push(summary),
            Err(err) if err.is_abort() => abort = abort.or(Some(err)),
            Err(err) => return Err(err),
        }
    }
    match abort {
        Some(err) => Err(err),
        None => Ok(summaries),
    }
}
