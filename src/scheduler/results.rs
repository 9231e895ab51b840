//! Result records produced by completed jobs.

use crate::error::SchedError;
use serde::{Deserialize, Serialize};

/// Function values of one evaluation plus the scalar objective the iterators minimize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub functions: Vec<f64>,
    pub objective: f64,
}

impl Response {
    pub fn new(functions: Vec<f64>, objective: f64) -> Self {
        Self { functions, objective }
    }
}

/// (variables, interface id, response) record of one final solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamResponsePair {
    pub variables: Vec<f64>,
    pub interface_id: String,
    pub response: Response,
}

impl ParamResponsePair {
    pub fn new(variables: Vec<f64>, interface_id: impl Into<String>, response: Response) -> Self {
        Self { variables, interface_id: interface_id.into(), response }
    }

    pub fn objective(&self) -> f64 {
        self.response.objective
    }

    /// Zero-filled record with the given shape, used to size job buffers.
    pub fn placeholder(num_variables: usize, num_functions: usize, interface_id: &str) -> Self {
        Self::new(
            vec![0.0; num_variables],
            interface_id,
            Response::new(vec![0.0; num_functions], 0.0),
        )
    }
}

/// All final solutions returned by one job.
pub type JobResult = Vec<ParamResponsePair>;

/// Lowest-objective record of a set, NaN objectives last.
pub fn best_of<'a, I>(pairs: I) -> Option<&'a ParamResponsePair>
where
    I: IntoIterator<Item = &'a ParamResponsePair>,
{
    pairs.into_iter().min_by(|a, b| a.objective().total_cmp(&b.objective()))
}

/// Results of one scheduling round, keyed by job index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResultTable {
    entries: Vec<Option<JobResult>>,
}

impl JobResultTable {
    pub fn new(num_jobs: usize) -> Self {
        Self { entries: vec![None; num_jobs] }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store the result of `job`. A job reports exactly once.
    pub fn insert(&mut self, job: usize, result: JobResult) -> Result<(), SchedError> {
        match self.entries.get_mut(job) {
            Some(Some(_)) => Err(SchedError::DuplicateResult { job }),
            Some(slot) => {
                *slot = Some(result);
                Ok(())
            }
            None => Err(SchedError::MissingResult { job }),
        }
    }

    pub fn get(&self, job: usize) -> Option<&JobResult> {
        self.entries.get(job).and_then(Option::as_ref)
    }

    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(Option::is_some)
    }

    /// Unwrap into per-job results; every job must have reported.
    pub fn into_results(self) -> Result<Vec<JobResult>, SchedError> {
        self.entries
            .into_iter()
            .enumerate()
            .map(|(job, entry)| entry.ok_or(SchedError::MissingResult { job }))
            .collect()
    }

    pub fn from_results(results: Vec<JobResult>) -> Self {
        Self { entries: results.into_iter().map(Some).collect() }
    }

    /// Every final solution of every job, in job order.
    pub fn flatten(&self) -> Vec<ParamResponsePair> {
        self.entries.iter().flatten().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prp(x: f64, f: f64) -> ParamResponsePair {
        ParamResponsePair::new(vec![x], "m", Response::new(vec![f], f))
    }

    #[test]
    fn table_reports_missing_jobs() {
        let mut table = JobResultTable::new(3);
        table.insert(2, vec![prp(2.0, 4.0)]).unwrap();
        table.insert(0, vec![prp(0.0, 0.5)]).unwrap();
        assert!(!table.is_complete());
        assert!(table.insert(3, Vec::new()).is_err());
        match table.into_results() {
            Err(SchedError::MissingResult { job }) => assert_eq!(job, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn second_report_for_a_job_is_rejected() {
        let mut table = JobResultTable::new(2);
        table.insert(1, vec![prp(1.0, 1.0)]).unwrap();
        match table.insert(1, vec![prp(9.0, 81.0)]) {
            Err(SchedError::DuplicateResult { job }) => assert_eq!(job, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(table.get(1).unwrap()[0].variables, vec![1.0]);
    }

    #[test]
    fn flatten_keeps_job_order() {
        let table = JobResultTable::from_results(vec![
            vec![prp(1.0, 3.0), prp(1.5, 2.0)],
            vec![prp(2.0, 1.0)],
        ]);
        let flat = table.flatten();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[2].variables, vec![2.0]);
        assert_eq!(best_of(&flat).unwrap().variables, vec![2.0]);
    }
}
