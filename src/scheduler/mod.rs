//! Iterator scheduling: partitioning a process group into iterator servers and
//! dispatching jobs to them.
//!
//! A meta-iterator owns one [`IteratorScheduler`] per set of sub-iterators it runs
//! concurrently. The scheduler splits the meta-iterator's process group into servers
//! (`init_iterator_parallelism`), records the server the calling process belongs to,
//! and runs a round of jobs with either the master or the peer protocol
//! (`schedule_iterators`). Job contents are supplied through [`IteratorJobs`].

pub mod codec;
pub mod partition;
pub mod results;

pub use codec::{Completion, Directive, JobCodec};
pub use partition::{
    max_procs_per_level, min_procs_per_level, partition, peer_job_blocks, ProcessorEstimate,
    SchedulingMode, ServerPartition,
};
pub use results::{best_of, JobResult, JobResultTable, ParamResponsePair, Response};

use crate::config::options::SchedulerOptions;
use crate::error::SchedError;
use crate::parallel::{Comm, Communicator, LevelId, ProcessTree, Tag};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Range;

pub const TAG_JOB: Tag = 1;
pub const TAG_RESULT: Tag = 2;
pub const TAG_PEER_RESULTS: Tag = 3;

/// Hooks a meta-iterator supplies for one scheduling round.
///
/// `initialize_job`, `run_job` and `update_local_results` are called on every member
/// of the server that runs the job; `job_params` and `representative_result` may be
/// called on any process of the group, including the dedicated master.
pub trait IteratorJobs {
    type Params: Serialize + DeserializeOwned + Clone;

    fn job_params(&self, job: usize) -> Self::Params;

    /// Result shaped like the largest one a job of this round can return.
    fn representative_result(&self) -> JobResult;

    fn initialize_job(&mut self, job: usize, params: &Self::Params) -> Result<(), SchedError>;

    fn run_job(&mut self, job: usize) -> Result<(), SchedError>;

    fn update_local_results(&mut self, job: usize) -> Result<JobResult, SchedError>;
}

fn run_one<H: IteratorJobs>(
    handler: &mut H,
    job: usize,
    params: &H::Params,
) -> Result<JobResult, SchedError> {
    handler.initialize_job(job, params)?;
    handler.run_job(job)?;
    handler.update_local_results(job)
}

#[derive(Debug)]
pub struct IteratorScheduler {
    options: SchedulerOptions,
    max_concurrency: usize,
    parent_level: Option<LevelId>,
    server_level: Option<LevelId>,
    partition: Option<ServerPartition>,
    server_id: usize,
    group: Option<Communicator>,
    server_comm: Option<Communicator>,
}

impl IteratorScheduler {
    pub fn new(options: SchedulerOptions, max_concurrency: usize) -> Self {
        Self {
            options,
            max_concurrency: max_concurrency.max(1),
            parent_level: None,
            server_level: None,
            partition: None,
            server_id: 0,
            group: None,
            server_comm: None,
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn set_max_concurrency(&mut self, max_concurrency: usize) {
        self.max_concurrency = max_concurrency.max(1);
    }

    pub fn partition(&self) -> Option<&ServerPartition> {
        self.partition.as_ref()
    }

    pub fn server_id(&self) -> usize {
        self.server_id
    }

    /// Level holding this process's server communicator.
    pub fn server_level(&self) -> Option<LevelId> {
        self.server_level
    }

    pub fn server_comm(&self) -> Option<&Communicator> {
        self.server_comm.as_ref()
    }

    pub fn group_comm(&self) -> Option<&Communicator> {
        self.group.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.partition.is_some()
    }

    pub fn is_master(&self) -> bool {
        self.partition.as_ref().is_some_and(|p| p.dedicated_master()) && self.server_id == 0
    }

    /// Inside one of the live servers.
    pub fn is_server_member(&self) -> bool {
        self.partition
            .as_ref()
            .is_some_and(|p| (1..=p.num_servers).contains(&self.server_id))
    }

    pub fn is_idle(&self) -> bool {
        self.partition.as_ref().is_some_and(|p| self.server_id > p.num_servers)
    }

    /// Jobs of a `num_jobs` round this process may run: its own block under peer
    /// scheduling, every job on a server under a master, nothing elsewhere.
    pub fn assigned_jobs(&self, num_jobs: usize) -> Range<usize> {
        match &self.partition {
            Some(p) if self.is_server_member() => match p.mode {
                SchedulingMode::Peer => peer_job_blocks(num_jobs, p.num_servers)
                    .get(self.server_id - 1)
                    .cloned()
                    .unwrap_or(0..0),
                SchedulingMode::Master => 0..num_jobs,
            },
            _ => 0..0,
        }
    }

    /// Partition the group at `parent` for `num_jobs` jobs and push the server level.
    pub fn init_iterator_parallelism(
        &mut self,
        tree: &mut ProcessTree,
        parent: LevelId,
        num_jobs: usize,
        estimate: ProcessorEstimate,
    ) -> Result<usize, SchedError> {
        if self.partition.is_some() {
            return Err(SchedError::Lifecycle { from: "partitioned", to: "partitioned" });
        }
        let group = tree
            .comm(parent)
            .cloned()
            .ok_or_else(|| SchedError::Spec(format!("process is not a member of level {parent}")))?;
        let partition = partition(
            num_jobs,
            self.max_concurrency,
            estimate,
            group.size(),
            &self.options,
        )?;
        let server_id = partition.assign(group.rank());
        let color = (1..=partition.num_servers).contains(&server_id).then_some(server_id);
        let server_comm = group.split(color, group.rank())?;

        if group.is_lead() {
            info!(
                "{} process(es) split into {} iterator server(s) of sizes {:?} ({} scheduling, \
                 {} idle) for {} job(s), estimate {}",
                group.size(),
                partition.num_servers,
                partition.server_sizes(),
                partition.mode,
                partition.idle_processes(),
                num_jobs,
                estimate
            );
        }

        self.server_level = Some(tree.push_child(parent, server_comm.clone(), server_id)?);
        self.parent_level = Some(parent);
        self.server_id = server_id;
        self.partition = Some(partition);
        self.group = Some(group);
        self.server_comm = server_comm;
        Ok(server_id)
    }

    /// Refresh communicators from the tree; the partition must exist.
    pub fn set_iterator_parallelism(&mut self, tree: &ProcessTree) -> Result<(), SchedError> {
        let (parent, level) = match (self.parent_level, self.server_level) {
            (Some(p), Some(l)) => (p, l),
            _ => return Err(SchedError::Lifecycle { from: "unpartitioned", to: "communicators set" }),
        };
        self.group = tree.comm(parent).cloned();
        self.server_comm = tree.group(level)?.comm().cloned();
        Ok(())
    }

    /// Release the server level and forget the partition.
    pub fn free_iterator_parallelism(&mut self, tree: &mut ProcessTree) -> Result<(), SchedError> {
        if let Some(level) = self.server_level.take() {
            tree.free(level)?;
        }
        self.parent_level = None;
        self.partition = None;
        self.group = None;
        self.server_comm = None;
        self.server_id = 0;
        Ok(())
    }

    /// Run one round of `num_jobs` jobs. Every process of the group must call this;
    /// all of them return the same complete table.
    pub fn schedule_iterators<H: IteratorJobs>(
        &self,
        handler: &mut H,
        num_jobs: usize,
    ) -> Result<JobResultTable, SchedError> {
        let (partition, group) = match (&self.partition, &self.group) {
            (Some(p), Some(g)) => (p, g),
            _ => return Err(SchedError::Lifecycle { from: "unpartitioned", to: "running" }),
        };
        if num_jobs == 0 {
            return Ok(JobResultTable::new(0));
        }
        let codec = JobCodec::negotiate(&handler.job_params(0), &handler.representative_result())?;

        let table = match partition.mode {
            SchedulingMode::Master => self.master_dispatch(partition, group, &codec, handler, num_jobs)?,
            SchedulingMode::Peer => self.peer_dispatch(partition, group, &codec, handler, num_jobs)?,
        };

        let mut buf = match &table {
            Some(table) => bincode::serialize(table)?,
            None => Vec::new(),
        };
        group.broadcast(0, &mut buf)?;
        let table: JobResultTable = bincode::deserialize(&buf)?;
        if let Some(job) = (0..num_jobs).find(|&j| table.get(j).is_none()) {
            return Err(SchedError::MissingResult { job });
        }
        Ok(table)
    }

    /// Returns the table on group rank 0 only.
    fn master_dispatch<H: IteratorJobs>(
        &self,
        partition: &ServerPartition,
        group: &Communicator,
        codec: &JobCodec,
        handler: &mut H,
        num_jobs: usize,
    ) -> Result<Option<JobResultTable>, SchedError> {
        if self.server_id == 0 {
            let mut queue: VecDeque<usize> = (0..num_jobs).collect();
            let mut table = JobResultTable::new(num_jobs);
            let mut active = 0usize;

            for server in 1..=partition.num_servers {
                let lead = partition.lead_rank(server);
                self.issue(group, codec, handler, lead, queue.pop_front(), &mut active)?;
            }
            while active > 0 {
                let (source, bytes) = group.recv_any(TAG_RESULT)?;
                let completion = codec.decode_completion(&bytes)?;
                active -= 1;
                debug!(
                    "job {} completed on iterator server {}",
                    completion.job + 1,
                    partition.assign(source)
                );
                table.insert(completion.job, completion.result)?;
                self.issue(group, codec, handler, source, queue.pop_front(), &mut active)?;
            }
            return Ok(Some(table));
        }

        if let Some(server) = self.server_comm.as_ref() {
            loop {
                let mut buf = if server.is_lead() { group.recv_from(0, TAG_JOB)? } else { Vec::new() };
                server.broadcast(0, &mut buf)?;
                match codec.decode_directive::<H::Params>(&buf)? {
                    Directive::Stop => break,
                    Directive::Run { job, params } => {
                        let result = run_one(handler, job, &params)?;
                        if server.is_lead() {
                            group.send(0, TAG_RESULT, &codec.encode_completion(job, &result)?)?;
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn issue<H: IteratorJobs>(
        &self,
        group: &Communicator,
        codec: &JobCodec,
        handler: &H,
        lead: usize,
        job: Option<usize>,
        active: &mut usize,
    ) -> Result<(), SchedError> {
        let bytes = match job {
            Some(job) => {
                debug!("dispatching job {} to group rank {lead}", job + 1);
                *active += 1;
                codec.encode_directive(&Directive::Run { job, params: handler.job_params(job) })?
            }
            None => codec.encode_directive::<H::Params>(&Directive::Stop)?,
        };
        group.send(lead, TAG_JOB, &bytes)?;
        Ok(())
    }

    /// Returns the table on group rank 0 (lead of server 1) only.
    fn peer_dispatch<H: IteratorJobs>(
        &self,
        partition: &ServerPartition,
        group: &Communicator,
        codec: &JobCodec,
        handler: &mut H,
        num_jobs: usize,
    ) -> Result<Option<JobResultTable>, SchedError> {
        let Some(server) = self.server_comm.as_ref() else {
            return Ok(None);
        };
        let blocks = peer_job_blocks(num_jobs, partition.num_servers);
        let block = blocks[self.server_id - 1].clone();
        let mut results = Vec::with_capacity(block.len());
        for job in block {
            debug!("iterator server {} running job {}", self.server_id, job + 1);
            let params = handler.job_params(job);
            results.push((job, run_one(handler, job, &params)?));
        }
        if !server.is_lead() {
            return Ok(None);
        }
        if self.server_id != 1 {
            group.send(0, TAG_PEER_RESULTS, &codec.encode_block(&results)?)?;
            return Ok(None);
        }

        let mut table = JobResultTable::new(num_jobs);
        for (job, result) in results {
            table.insert(job, result)?;
        }
        for other in 2..=partition.num_servers {
            let bytes = group.recv_from(partition.lead_rank(other), TAG_PEER_RESULTS)?;
            for (job, result) in codec.decode_block(&bytes, blocks[other - 1].len())? {
                table.insert(job, result)?;
            }
        }
        Ok(Some(table))
    }
}
