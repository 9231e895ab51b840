//! Wire format of the job protocols.
//!
//! Messages are bincode-encoded. Capacities are fixed once per scheduling round from a
//! representative job; an encoded message that does not fit is rejected on both the
//! sending and the receiving side.

use super::results::JobResult;
use crate::error::SchedError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Master (or server lead) to server member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Directive<P> {
    Run { job: usize, params: P },
    Stop,
}

/// Server lead to master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub job: usize,
    pub result: JobResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCodec {
    directive_capacity: usize,
    completion_capacity: usize,
}

impl JobCodec {
    pub fn new(directive_capacity: usize, completion_capacity: usize) -> Self {
        Self { directive_capacity, completion_capacity }
    }

    /// Size both buffers from one representative job.
    pub fn negotiate<P: Serialize>(
        params: &P,
        result: &JobResult,
    ) -> Result<Self, SchedError> {
        let directive = bincode::serialized_size(&Directive::Run { job: usize::MAX, params })?;
        let completion = bincode::serialized_size(&CompletionRef { job: usize::MAX, result })?;
        Ok(Self::new(directive as usize, completion as usize))
    }

    pub fn directive_capacity(&self) -> usize {
        self.directive_capacity
    }

    pub fn completion_capacity(&self) -> usize {
        self.completion_capacity
    }

    /// Capacity of a peer block carrying `jobs` results.
    pub fn block_capacity(&self, jobs: usize) -> usize {
        8usize.saturating_add(jobs.saturating_mul(self.completion_capacity))
    }

    pub fn encode_directive<P: Serialize>(&self, directive: &Directive<P>) -> Result<Vec<u8>, SchedError> {
        let job = match directive {
            Directive::Run { job, .. } => *job,
            Directive::Stop => 0,
        };
        let bytes = bincode::serialize(directive)?;
        check("job", job, bytes.len(), self.directive_capacity)?;
        Ok(bytes)
    }

    pub fn decode_directive<P: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Directive<P>, SchedError> {
        check("job", 0, bytes.len(), self.directive_capacity)?;
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn encode_completion(&self, job: usize, result: &JobResult) -> Result<Vec<u8>, SchedError> {
        let bytes = bincode::serialize(&CompletionRef { job, result })?;
        check("result", job, bytes.len(), self.completion_capacity)?;
        Ok(bytes)
    }

    pub fn decode_completion(&self, bytes: &[u8]) -> Result<Completion, SchedError> {
        check("result", 0, bytes.len(), self.completion_capacity)?;
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn encode_block(&self, block: &[(usize, JobResult)]) -> Result<Vec<u8>, SchedError> {
        let bytes = bincode::serialize(block)?;
        let first = block.first().map_or(0, |(job, _)| *job);
        check("result block", first, bytes.len(), self.block_capacity(block.len()))?;
        Ok(bytes)
    }

    pub fn decode_block(&self, bytes: &[u8], jobs: usize) -> Result<Vec<(usize, JobResult)>, SchedError> {
        check("result block", 0, bytes.len(), self.block_capacity(jobs))?;
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Borrowing twin of [`Completion`] with the same encoding.
#[derive(Serialize)]
struct CompletionRef<'a> {
    job: usize,
    result: &'a JobResult,
}

fn check(kind: &'static str, job: usize, len: usize, capacity: usize) -> Result<(), SchedError> {
    if len > capacity {
        return Err(SchedError::MessageOverflow { kind, job, len, capacity });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::results::ParamResponsePair;

    #[test]
    fn smaller_results_fit_larger_ones_overflow() {
        let rep = vec![ParamResponsePair::placeholder(2, 1, "ps"); 2];
        let codec = JobCodec::negotiate(&vec![0.0f64; 2], &rep).unwrap();

        let one = vec![ParamResponsePair::placeholder(2, 1, "ps")];
        let bytes = codec.encode_completion(3, &one).unwrap();
        let back = codec.decode_completion(&bytes).unwrap();
        assert_eq!(back.job, 3);
        assert_eq!(back.result, one);

        let three = vec![ParamResponsePair::placeholder(2, 1, "ps"); 3];
        match codec.encode_completion(4, &three) {
            Err(SchedError::MessageOverflow { kind: "result", job: 4, .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stop_fits_any_capacity() {
        let codec = JobCodec::negotiate(&vec![1.0f64; 4], &Vec::new()).unwrap();
        let bytes = codec.encode_directive::<Vec<f64>>(&Directive::Stop).unwrap();
        assert_eq!(codec.decode_directive::<Vec<f64>>(&bytes).unwrap(), Directive::Stop);
        assert!(codec.encode_directive(&Directive::Run { job: 0, params: vec![1.0f64; 5] }).is_err());
    }
}
