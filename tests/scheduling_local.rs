//! Scheduling rounds on thread ranks.
//!
//! Each test runs the full protocol (partition, split, dispatch, result broadcast) on a
//! `LocalUniverse` and checks that every rank ends up with the same complete table.

use metasched::config::{SchedulerOptions, SchedulingChoice};
use metasched::error::SchedError;
use metasched::parallel::{LocalUniverse, ProcessTree};
use metasched::scheduler::{
    IteratorJobs, IteratorScheduler, JobResult, JobResultTable, ParamResponsePair, ProcessorEstimate, Response,
    SchedulingMode,
};
use std::thread;
use std::time::Duration;

struct Delayed {
    delays_ms: Vec<u64>,
    current: f64,
    ran: Vec<usize>,
}

impl IteratorJobs for Delayed {
    type Params = f64;

    fn job_params(&self, job: usize) -> f64 {
        job as f64 + 0.5
    }

    fn representative_result(&self) -> JobResult {
        vec![ParamResponsePair::placeholder(1, 1, "delayed")]
    }

    fn initialize_job(&mut self, _job: usize, params: &f64) -> Result<(), SchedError> {
        self.current = *params;
        Ok(())
    }

    fn run_job(&mut self, job: usize) -> Result<(), SchedError> {
        thread::sleep(Duration::from_millis(self.delays_ms[job]));
        self.ran.push(job);
        Ok(())
    }

    fn update_local_results(&mut self, _job: usize) -> Result<JobResult, SchedError> {
        let x = self.current;
        Ok(vec![ParamResponsePair::new(vec![x], "delayed", Response::new(vec![x * x], x * x))])
    }
}

struct RankOutcome {
    table: JobResultTable,
    ran: Vec<usize>,
    mode: SchedulingMode,
    server_id: usize,
    num_servers: usize,
}

fn run_round(
    processes: usize,
    opts: &SchedulerOptions,
    estimate: ProcessorEstimate,
    delays_ms: &[u64],
) -> Vec<RankOutcome> {
    let jobs = delays_ms.len();
    LocalUniverse::new(processes)
        .run(|comm| {
            let mut tree = ProcessTree::new(comm.into());
            let mut scheduler = IteratorScheduler::new(opts.clone(), jobs);
            scheduler.init_iterator_parallelism(&mut tree, ProcessTree::ROOT, jobs, estimate)?;
            let mut handler = Delayed { delays_ms: delays_ms.to_vec(), current: 0.0, ran: Vec::new() };
            let table = scheduler.schedule_iterators(&mut handler, jobs)?;
            let partition = scheduler
                .partition()
                .cloned()
                .ok_or_else(|| SchedError::Spec("scheduler was not partitioned".into()))?;
            let outcome = RankOutcome {
                table,
                ran: handler.ran,
                mode: partition.mode,
                server_id: scheduler.server_id(),
                num_servers: partition.num_servers,
            };
            scheduler.free_iterator_parallelism(&mut tree)?;
            Ok::<_, SchedError>(outcome)
        })
        .unwrap()
        .into_iter()
        .map(Result::unwrap)
        .collect()
}

fn objectives(table: &JobResultTable) -> Vec<f64> {
    (0..table.len()).map(|j| table.get(j).unwrap()[0].objective()).collect()
}

#[test]
fn master_results_do_not_depend_on_completion_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let opts = SchedulerOptions::default().with_scheduling(SchedulingChoice::Master);
    let fast_first = run_round(4, &opts, ProcessorEstimate::serial(), &[1, 5, 10, 15, 20, 25]);
    let slow_first = run_round(4, &opts, ProcessorEstimate::serial(), &[25, 20, 15, 10, 5, 1]);

    assert!(fast_first.iter().all(|o| o.mode == SchedulingMode::Master));
    let expected: Vec<f64> = (0..6).map(|j| (j as f64 + 0.5).powi(2)).collect();
    for outcome in fast_first.iter().chain(&slow_first) {
        assert!(outcome.table.is_complete());
        assert_eq!(objectives(&outcome.table), expected);
    }
    assert_eq!(fast_first[0].table, slow_first[0].table);
    // the master itself runs nothing
    assert!(fast_first[0].ran.is_empty());
    let total: usize = fast_first.iter().map(|o| o.ran.len()).sum();
    assert_eq!(total, 6);
}

#[test]
fn peer_round_shares_the_complete_table() {
    let opts = SchedulerOptions::default().with_scheduling(SchedulingChoice::Peer);
    let outcomes = run_round(3, &opts, ProcessorEstimate::serial(), &[0; 7]);
    assert!(outcomes.iter().all(|o| o.mode == SchedulingMode::Peer && o.num_servers == 3));
    let runs: Vec<Vec<usize>> = outcomes.iter().map(|o| o.ran.clone()).collect();
    assert_eq!(runs, vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]);
    for outcome in &outcomes {
        assert_eq!(outcome.table, outcomes[0].table);
        assert_eq!(outcome.table.len(), 7);
    }
}

#[test]
fn multi_process_servers_leave_spare_ranks_idle() {
    let opts = SchedulerOptions::default()
        .with_scheduling(SchedulingChoice::Peer)
        .with_processors_per_iterator(2);
    let outcomes = run_round(5, &opts, ProcessorEstimate::new(1, 4), &[0; 4]);
    let ids: Vec<usize> = outcomes.iter().map(|o| o.server_id).collect();
    assert_eq!(ids, vec![1, 1, 2, 2, 3]);
    // both members of a server run its jobs; the idle rank runs none
    assert_eq!(outcomes[0].ran, vec![0, 1]);
    assert_eq!(outcomes[1].ran, vec![0, 1]);
    assert_eq!(outcomes[3].ran, vec![2, 3]);
    assert!(outcomes[4].ran.is_empty());
    assert_eq!(outcomes[4].table, outcomes[0].table);
}

#[test]
fn auto_mode_uses_a_master_when_jobs_outnumber_servers() {
    let outcomes = run_round(3, &SchedulerOptions::default(), ProcessorEstimate::serial(), &[2; 8]);
    assert_eq!(outcomes[0].mode, SchedulingMode::Master);
    assert_eq!(outcomes[0].num_servers, 2);
    assert!(outcomes.iter().all(|o| o.table.is_complete()));
}
