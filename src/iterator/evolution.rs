//! (μ+λ) evolution strategy.
//!
//! Parents are the starting points (padded with uniform samples up to μ). Each
//! generation draws λ offspring by uniform mutation of random parents and keeps the
//! best μ of parents and offspring. The final population is returned.

use super::{run_rng, Capabilities, FinalSolutions, LeafCore, LeafMethod};
use crate::config::EvolutionSpec;
use crate::error::SchedError;
use crate::model::{AnyModel, Model};
use crate::scheduler::ParamResponsePair;
use rand::rngs::StdRng;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct EvolutionStrategy {
    core: LeafCore,
    spec: EvolutionSpec,
}

impl EvolutionStrategy {
    pub fn new(model: AnyModel, spec: EvolutionSpec) -> Self {
        Self { core: LeafCore::new(model), spec }
    }

    fn mu(&self) -> usize {
        self.spec.population.max(1)
    }
}

fn sample(rng: &mut StdRng, lower: &[f64], upper: &[f64]) -> Vec<f64> {
    lower
        .iter()
        .zip(upper)
        .map(|(&lo, &hi)| if hi > lo { rng.gen_range(lo..=hi) } else { lo })
        .collect()
}

impl LeafMethod for EvolutionStrategy {
    const NAME: &'static str = "evolution_strategy";
    const CAPABILITIES: Capabilities =
        Capabilities::ACCEPTS_MULTIPLE_POINTS.union(Capabilities::RETURNS_MULTIPLE_POINTS);

    fn core(&self) -> &LeafCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LeafCore {
        &mut self.core
    }

    fn num_final_solutions(&self) -> FinalSolutions {
        FinalSolutions::AlgorithmDefined
    }

    fn population_size(&self) -> usize {
        self.mu()
    }

    fn iterate(&mut self, starts: Vec<Vec<f64>>) -> Result<Vec<ParamResponsePair>, SchedError> {
        let mu = self.mu();
        let lambda = self.spec.offspring.max(1);
        let generations = self.core.max_iterations(self.spec.generations);
        let lower = self.core.model.lower_bounds().to_vec();
        let upper = self.core.model.upper_bounds().to_vec();
        let scale: Vec<f64> = lower.iter().zip(&upper).map(|(lo, hi)| self.spec.sigma * (hi - lo)).collect();
        let mut rng = run_rng(self.spec.seed, &starts);

        let mut population = Vec::with_capacity(mu + lambda);
        let mut seeds = starts;
        seeds.truncate(mu);
        while seeds.len() < mu {
            seeds.push(sample(&mut rng, &lower, &upper));
        }
        for x in seeds {
            let response = self.core.evaluate(&x)?;
            population.push(self.core.record(x, response));
        }

        for _ in 0..generations {
            for _ in 0..lambda {
                let parent = rng.gen_range(0..population.len().min(mu));
                let mut child = population[parent].variables.clone();
                for (ci, s) in child.iter_mut().zip(&scale) {
                    if *s > 0.0 {
                        *ci += rng.gen_range(-*s..=*s);
                    }
                }
                self.core.model.project(&mut child);
                let response = self.core.evaluate(&child)?;
                population.push(self.core.record(child, response));
            }
            population.sort_by(|a, b| a.objective().total_cmp(&b.objective()));
            population.truncate(mu);
        }
        population.sort_by(|a, b| a.objective().total_cmp(&b.objective()));
        Ok(population)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelBlock, TestFunction};
    use crate::iterator::Algorithm;

    #[test]
    fn population_improves_on_seeds() {
        let block = ModelBlock::new(
            "p",
            TestFunction::Paraboloids { centers: vec![vec![0.5, 0.5]] },
            vec![-2.0; 2],
            vec![2.0; 2],
            vec![-2.0, -2.0],
        );
        let mut es = EvolutionStrategy::new(AnyModel::simulation(&block).unwrap(), EvolutionSpec::default());
        es.set_initial_points(&[vec![-2.0, -2.0], vec![2.0, 2.0]]).unwrap();
        es.run().unwrap();
        let finals = es.final_solutions();
        assert_eq!(finals.len(), crate::iterator::Algorithm::population_size(&es));
        assert!(finals[0].objective() < 0.05);
        assert!(es.accepts_multiple_points() && es.returns_multiple_points());
    }
}
