//! Uniform random sampling inside the model bounds.

use super::{run_rng, Capabilities, FinalSolutions, LeafCore, LeafMethod};
use crate::config::SamplingSpec;
use crate::error::SchedError;
use crate::model::{AnyModel, Model};
use crate::scheduler::ParamResponsePair;
use rand::Rng;

/// Returns its best `final_solutions` samples, or the best eighth of all samples when
/// no count is configured.
#[derive(Debug, Clone)]
pub struct RandomSampling {
    core: LeafCore,
    spec: SamplingSpec,
}

impl RandomSampling {
    pub fn new(model: AnyModel, spec: SamplingSpec) -> Self {
        Self { core: LeafCore::new(model), spec }
    }
}

impl LeafMethod for RandomSampling {
    const NAME: &'static str = "random_sampling";
    const CAPABILITIES: Capabilities = Capabilities::RETURNS_MULTIPLE_POINTS;

    fn core(&self) -> &LeafCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LeafCore {
        &mut self.core
    }

    fn num_final_solutions(&self) -> FinalSolutions {
        match self.spec.final_solutions {
            Some(k) => FinalSolutions::Fixed(k),
            None => FinalSolutions::AlgorithmDefined,
        }
    }

    fn population_size(&self) -> usize {
        (self.spec.samples / 8).max(1)
    }

    fn iterate(&mut self, starts: Vec<Vec<f64>>) -> Result<Vec<ParamResponsePair>, SchedError> {
        let samples = self.core.max_iterations(self.spec.samples);
        let keep = LeafMethod::num_final_solutions(self);
        let keep = match keep {
            FinalSolutions::Fixed(k) => k,
            FinalSolutions::AlgorithmDefined => LeafMethod::population_size(self),
        };
        let lower = self.core.model.lower_bounds().to_vec();
        let upper = self.core.model.upper_bounds().to_vec();
        let mut rng = run_rng(self.spec.seed, &starts);

        let mut pairs = Vec::with_capacity(samples + starts.len());
        for x in starts {
            let response = self.core.evaluate(&x)?;
            pairs.push(self.core.record(x, response));
        }
        for _ in 0..samples {
            let x: Vec<f64> = lower
                .iter()
                .zip(&upper)
                .map(|(&lo, &hi)| if hi > lo { rng.gen_range(lo..=hi) } else { lo })
                .collect();
            let response = self.core.evaluate(&x)?;
            pairs.push(self.core.record(x, response));
        }
        pairs.sort_by(|a, b| a.objective().total_cmp(&b.objective()));
        pairs.truncate(keep);
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelBlock, TestFunction};
    use crate::iterator::Algorithm;

    #[test]
    fn keeps_best_samples_in_order() {
        let block = ModelBlock::new("r", TestFunction::Rastrigin, vec![-5.0; 3], vec![5.0; 3], vec![4.0; 3]);
        let spec = SamplingSpec { samples: 40, seed: 11, final_solutions: Some(4) };
        let mut rs = RandomSampling::new(AnyModel::simulation(&block).unwrap(), spec);
        rs.run().unwrap();
        let finals = rs.final_solutions();
        assert_eq!(finals.len(), 4);
        assert!(finals.windows(2).all(|w| w[0].objective() <= w[1].objective()));
        assert_eq!(rs.evaluations(), 41);
        assert!(finals.iter().all(|p| p.variables.iter().all(|v| (-5.0..=5.0).contains(v))));
    }

    #[test]
    fn repeated_runs_from_the_same_start_agree() {
        let block = ModelBlock::new("r", TestFunction::Rastrigin, vec![-5.0; 2], vec![5.0; 2], vec![4.0; 2]);
        let spec = SamplingSpec { samples: 12, seed: 3, final_solutions: Some(2) };
        let mut rs = RandomSampling::new(AnyModel::simulation(&block).unwrap(), spec);
        rs.set_initial_points(&[vec![1.0, -1.0]]).unwrap();
        rs.run().unwrap();
        let first = rs.final_solutions().to_vec();

        rs.set_initial_points(&[vec![2.0, 2.0]]).unwrap();
        rs.run().unwrap();
        let other = rs.final_solutions().to_vec();

        rs.set_initial_points(&[vec![1.0, -1.0]]).unwrap();
        rs.run().unwrap();
        assert_eq!(rs.final_solutions(), first.as_slice());
        assert_ne!(other, first);
    }

    #[test]
    fn algorithm_defined_count_follows_population() {
        let block = ModelBlock::new("r", TestFunction::Rastrigin, vec![-1.0; 2], vec![1.0; 2], vec![0.0; 2]);
        let rs = RandomSampling::new(AnyModel::placeholder(&block), SamplingSpec { samples: 24, ..SamplingSpec::default() });
        assert_eq!(crate::iterator::Algorithm::num_final_solutions(&rs), FinalSolutions::AlgorithmDefined);
        assert_eq!(rs.max_final_solutions(), 3);
    }
}
