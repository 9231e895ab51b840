//! Processor estimates and the division of a process group into iterator servers.

use crate::config::options::{SchedulerOptions, SchedulingChoice};
use crate::error::SchedError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Range of processes one iterator instance can make use of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorEstimate {
    pub min: usize,
    pub max: usize,
}

impl ProcessorEstimate {
    /// Sentinel for "scales to any number of processes".
    pub const UNBOUNDED: usize = usize::MAX;

    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        Self { min, max: max.max(min) }
    }

    pub fn serial() -> Self {
        Self::new(1, 1)
    }

    pub fn unbounded(min: usize) -> Self {
        Self::new(min, Self::UNBOUNDED)
    }

    pub fn is_unbounded(&self) -> bool {
        self.max == Self::UNBOUNDED
    }

    /// Min of mins, max of maxes. `None` for an empty batch.
    pub fn aggregate<I: IntoIterator<Item = ProcessorEstimate>>(estimates: I) -> Option<Self> {
        estimates.into_iter().reduce(|acc, e| Self {
            min: acc.min.min(e.min),
            max: acc.max.max(e.max),
        })
    }
}

impl fmt::Display for ProcessorEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "[{}, unbounded]", self.min)
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingMode {
    /// Group rank 0 is a dedicated master handing out jobs one at a time.
    Master,
    /// Servers run fixed contiguous blocks of jobs.
    Peer,
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingMode::Master => f.write_str("master"),
            SchedulingMode::Peer => f.write_str("peer"),
        }
    }
}

/// Division of one process group into iterator servers.
///
/// Server ids are 1-based. Id 0 is the dedicated master, ids past `num_servers` are
/// idle processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPartition {
    pub num_servers: usize,
    pub procs_per_server: usize,
    pub mode: SchedulingMode,
    pub available: usize,
    server_sizes: Vec<usize>,
}

impl ServerPartition {
    /// Trivial partition of a group into a single peer server.
    pub fn single(available: usize) -> Self {
        let available = available.max(1);
        Self {
            num_servers: 1,
            procs_per_server: available,
            mode: SchedulingMode::Peer,
            available,
            server_sizes: vec![available],
        }
    }

    pub fn dedicated_master(&self) -> bool {
        self.mode == SchedulingMode::Master
    }

    /// True when dispatch involves messages between servers.
    pub fn message_passing(&self) -> bool {
        self.dedicated_master() || self.num_servers > 1
    }

    fn master_offset(&self) -> usize {
        usize::from(self.dedicated_master())
    }

    pub fn server_sizes(&self) -> &[usize] {
        &self.server_sizes
    }

    /// Processes in server `id` (1-based); 0 for the master or idle ids.
    pub fn server_size(&self, id: usize) -> usize {
        match id {
            0 => 0,
            id => self.server_sizes.get(id - 1).copied().unwrap_or(0),
        }
    }

    /// Group rank of the lead process of server `id` (1-based).
    pub fn lead_rank(&self, id: usize) -> usize {
        let before: usize = self.server_sizes.iter().take(id.saturating_sub(1)).sum();
        self.master_offset() + before
    }

    /// Server id of group rank `rank`.
    pub fn assign(&self, rank: usize) -> usize {
        if self.dedicated_master() && rank == 0 {
            return 0;
        }
        let mut offset = self.master_offset();
        for (i, size) in self.server_sizes.iter().enumerate() {
            if rank < offset + size {
                return i + 1;
            }
            offset += size;
        }
        self.num_servers + 1
    }

    pub fn busy_processes(&self) -> usize {
        self.master_offset() + self.server_sizes.iter().sum::<usize>()
    }

    pub fn idle_processes(&self) -> usize {
        self.available.saturating_sub(self.busy_processes())
    }
}

/// Number of servers the group could be split into for the given options.
fn requested_servers(opts: &SchedulerOptions, concurrency: usize, num_jobs: usize) -> usize {
    match opts.iterator_servers {
        Some(0) => {
            warn!("iterator_servers = 0 is not meaningful, using 1");
            1
        }
        Some(n) if n > num_jobs => {
            warn!("iterator_servers = {n} exceeds the {num_jobs} job(s) of this round, using {num_jobs}");
            num_jobs
        }
        Some(n) => n,
        None => concurrency,
    }
}

/// Split `available` processes into iterator servers for `num_jobs` jobs.
///
/// `target_concurrency` is advisory: the number of servers never exceeds the number
/// of jobs or what the per-server minimum allows, and never drops below one.
pub fn partition(
    num_jobs: usize,
    target_concurrency: usize,
    estimate: ProcessorEstimate,
    available: usize,
    opts: &SchedulerOptions,
) -> Result<ServerPartition, SchedError> {
    let num_jobs = num_jobs.max(1);
    let min_ppi = opts.processors_per_iterator.unwrap_or(estimate.min).max(1);
    let max_ppi = match opts.processors_per_iterator {
        Some(_) => min_ppi,
        None => estimate.max.max(min_ppi),
    };
    if available < min_ppi {
        return Err(SchedError::PartitionInfeasible { available, required: min_ppi });
    }

    let concurrency = target_concurrency.max(1).min(num_jobs);
    let desired = requested_servers(opts, concurrency, num_jobs);
    let peer_servers = desired.min(available / min_ppi).max(1);
    let master_servers = desired.min((available - 1) / min_ppi);

    let mode = match opts.iterator_scheduling {
        SchedulingChoice::Peer => SchedulingMode::Peer,
        SchedulingChoice::Master if available > min_ppi => SchedulingMode::Master,
        SchedulingChoice::Master => {
            warn!(
                "master scheduling requested but {available} process(es) leave no room for a \
                 dedicated master next to a {min_ppi}-process server; using peer scheduling"
            );
            SchedulingMode::Peer
        }
        SchedulingChoice::Auto if num_jobs > peer_servers && master_servers >= 2 => {
            SchedulingMode::Master
        }
        SchedulingChoice::Auto => SchedulingMode::Peer,
    };

    let for_servers = available - usize::from(mode == SchedulingMode::Master);
    let cap = for_servers / min_ppi;
    if let Some(n) = opts.iterator_servers {
        if n > cap {
            warn!("iterator_servers = {n} does not fit in {for_servers} process(es), using {cap}");
        }
    }
    let num_servers = desired.min(cap).max(1);

    let base = (for_servers / num_servers).clamp(min_ppi, max_ppi);
    let mut server_sizes = vec![base; num_servers];
    let mut remainder = for_servers - base * num_servers;
    for size in server_sizes.iter_mut() {
        if remainder == 0 {
            break;
        }
        if *size < max_ppi {
            *size += 1;
            remainder -= 1;
        }
    }

    Ok(ServerPartition { num_servers, procs_per_server: base, mode, available, server_sizes })
}

/// Contiguous near-equal job blocks for static peer dispatch; the first
/// `num_jobs % num_servers` servers get one extra job.
pub fn peer_job_blocks(num_jobs: usize, num_servers: usize) -> Vec<Range<usize>> {
    let num_servers = num_servers.max(1);
    let q = num_jobs / num_servers;
    let r = num_jobs % num_servers;
    let mut start = 0;
    (0..num_servers)
        .map(|s| {
            let len = q + usize::from(s < r);
            let block = start..start + len;
            start += len;
            block
        })
        .collect()
}

/// Fewest processes a meta-iterator level can run on.
pub fn min_procs_per_level(estimate: ProcessorEstimate, opts: &SchedulerOptions) -> usize {
    let per_server = opts.processors_per_iterator.unwrap_or(estimate.min).max(1);
    let servers = opts.iterator_servers.unwrap_or(1).max(1);
    let master = usize::from(opts.iterator_scheduling == SchedulingChoice::Master);
    per_server.saturating_mul(servers) + master
}

/// Most processes a meta-iterator level can put to use.
pub fn max_procs_per_level(
    estimate: ProcessorEstimate,
    opts: &SchedulerOptions,
    max_concurrency: usize,
) -> usize {
    let per_server = match opts.processors_per_iterator {
        Some(p) => p.max(1),
        None if estimate.is_unbounded() => return ProcessorEstimate::UNBOUNDED,
        None => estimate.max,
    };
    let servers = opts.iterator_servers.unwrap_or(max_concurrency).max(1);
    let master = match opts.iterator_scheduling {
        SchedulingChoice::Peer => 0,
        SchedulingChoice::Master => 1,
        SchedulingChoice::Auto => usize::from(servers > 1),
    };
    per_server
        .checked_mul(servers)
        .and_then(|n| n.checked_add(master))
        .unwrap_or(ProcessorEstimate::UNBOUNDED)
}
