//! Partition sizing and static job distribution over randomized inputs.

use metasched::config::{SchedulerOptions, SchedulingChoice};
use metasched::scheduler::{partition, peer_job_blocks, ProcessorEstimate, SchedulingMode};
use proptest::prelude::*;

proptest! {
    #[test]
    fn server_count_stays_within_bounds(
        num_jobs in 1usize..64,
        min_procs in 1usize..8,
        extra_max in 0usize..8,
        surplus in 0usize..64,
        target in 1usize..64,
    ) {
        let available = min_procs + surplus;
        let estimate = ProcessorEstimate::new(min_procs, min_procs + extra_max);
        let p = partition(num_jobs, target, estimate, available, &SchedulerOptions::default()).unwrap();
        prop_assert!(p.num_servers >= 1);
        prop_assert!(p.num_servers <= num_jobs.min(available / min_procs));
        prop_assert!(p.busy_processes() <= available);
        for &size in p.server_sizes() {
            prop_assert!(size >= min_procs && size <= min_procs + extra_max);
        }
    }

    #[test]
    fn every_rank_maps_to_exactly_one_role(
        num_jobs in 1usize..32,
        min_procs in 1usize..4,
        surplus in 0usize..32,
        forced_master in any::<bool>(),
    ) {
        let available = min_procs + surplus;
        let opts = if forced_master {
            SchedulerOptions::default().with_scheduling(SchedulingChoice::Master)
        } else {
            SchedulerOptions::default()
        };
        let p = partition(num_jobs, num_jobs, ProcessorEstimate::new(min_procs, min_procs), available, &opts).unwrap();
        let mut counts = vec![0usize; p.num_servers + 2];
        for rank in 0..available {
            counts[p.assign(rank).min(p.num_servers + 1)] += 1;
        }
        prop_assert_eq!(counts[0], usize::from(p.mode == SchedulingMode::Master));
        for id in 1..=p.num_servers {
            prop_assert_eq!(counts[id], p.server_size(id));
            prop_assert_eq!(p.assign(p.lead_rank(id)), id);
        }
        prop_assert_eq!(counts[p.num_servers + 1], p.idle_processes());
    }

    #[test]
    fn peer_blocks_cover_jobs_with_balanced_remainder(num_jobs in 0usize..200, num_servers in 1usize..20) {
        let blocks = peer_job_blocks(num_jobs, num_servers);
        prop_assert_eq!(blocks.len(), num_servers);
        let q = num_jobs / num_servers;
        let r = num_jobs % num_servers;
        prop_assert_eq!(blocks.iter().filter(|b| b.len() == q + 1).count(), r);
        prop_assert_eq!(blocks.iter().filter(|b| b.len() == q).count(), num_servers - r);
        let covered: Vec<usize> = blocks.into_iter().flatten().collect();
        prop_assert_eq!(covered, (0..num_jobs).collect::<Vec<_>>());
    }
}

#[test]
fn three_jobs_on_six_processes_get_a_server_each() {
    let p = partition(3, 3, ProcessorEstimate::new(1, 2), 6, &SchedulerOptions::default()).unwrap();
    assert_eq!(p.num_servers, 3);
    let blocks = peer_job_blocks(3, p.num_servers);
    assert!(blocks.iter().all(|b| b.len() == 1));
}

#[test]
fn concurrency_request_is_advisory() {
    let p = partition(5, 5, ProcessorEstimate::new(1, 1), 1, &SchedulerOptions::default()).unwrap();
    assert_eq!(p.num_servers, 1);
    assert_eq!(p.mode, SchedulingMode::Peer);
    assert_eq!(peer_job_blocks(5, 1), vec![0..5]);
}
