//! Per-method scheduling options.
//!
//! This module provides the `SchedulerOptions` struct, which is attached to every
//! meta-iterator method block. All fields are optional: when left unset the scheduler
//! derives server counts, server sizes and the dispatch protocol from the processor
//! estimate of the sub-iterators and the size of the enclosing process group.

use serde::{Deserialize, Serialize};

/// Dispatch protocol requested for a meta-iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingChoice {
    /// Let the partitioner choose between master and peer.
    #[default]
    Auto,
    /// Dedicated master process with dynamic job assignment.
    Master,
    /// Static block assignment across peer servers.
    Peer,
}

/// Iterator-server sizing & dispatch overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Requested number of concurrent iterator servers
    pub iterator_servers: Option<usize>,

    /// Fixed number of processes per iterator server
    pub processors_per_iterator: Option<usize>,

    /// Dispatch protocol (auto, master, peer)
    pub iterator_scheduling: SchedulingChoice,
}

impl SchedulerOptions {
    pub fn with_servers(mut self, servers: usize) -> Self {
        self.iterator_servers = Some(servers);
        self
    }

    pub fn with_processors_per_iterator(mut self, procs: usize) -> Self {
        self.processors_per_iterator = Some(procs);
        self
    }

    pub fn with_scheduling(mut self, choice: SchedulingChoice) -> Self {
        self.iterator_scheduling = choice;
        self
    }
}
