//! End-to-end runs of the meta-iterators, serially and on thread ranks.

use approx::assert_abs_diff_eq;
use metasched::config::ProblemDescription;
use metasched::context::{Construction, IteratorFactory};
use metasched::environment::{run_local, Environment, RunSummary};
use metasched::error::SchedError;
use metasched::iterator::AnyIterator;
use metasched::parallel::{ProcessTree, SerialComm};
use std::sync::Arc;

const QUADRATIC: &str = r#"{"id": "quad",
    "function": {"type": "quadratic", "hessian": [[2, 0], [0, 2]], "center": [0.3, -0.4]},
    "lower_bounds": [-1, -1], "upper_bounds": [1, 1], "initial_point": [0.9, 0.9]}"#;

const PARABOLOIDS: &str = r#"{"id": "pair",
    "function": {"type": "paraboloids", "centers": [[0, 0], [1, 1]]},
    "lower_bounds": [-2, -2], "upper_bounds": [2, 2], "initial_point": [1.5, -1.5]}"#;

fn description(top: &str, methods: &[&str], model: &str) -> Arc<ProblemDescription> {
    let text = format!(r#"{{"top_method": "{top}", "methods": [{}], "models": [{model}]}}"#, methods.join(","));
    Arc::new(ProblemDescription::from_json(&text).unwrap())
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build the top method on a single process and take it through its lifecycle.
fn run_serial(description: Arc<ProblemDescription>) -> AnyIterator {
    let factory = IteratorFactory::new(Arc::clone(&description));
    let mut top = factory.build_method(&description.top_method, Construction::Full).unwrap();
    let mut tree = ProcessTree::new(SerialComm.into());
    let it = top.as_algorithm_mut();
    it.init_communicators(&mut tree, ProcessTree::ROOT).unwrap();
    it.set_communicators(&tree, ProcessTree::ROOT).unwrap();
    it.run().unwrap();
    it.free_communicators(&mut tree, ProcessTree::ROOT).unwrap();
    assert_eq!(tree.live_levels(), 1);
    top
}

fn assert_shared(summaries: &[RunSummary]) {
    for summary in summaries {
        assert_eq!(summary.final_solutions, summaries[0].final_solutions);
    }
}

const SAMPLER: &str = r#"{"id": "sampler", "method": {"type": "random_sampling", "samples": 16, "seed": 3, "final_solutions": 4}}"#;
const POLISH: &str = r#"{"id": "polish", "method": {"type": "pattern_search"}}"#;
const CHAIN: &str = r#"{"id": "chain", "method": {"type": "hybrid_sequential", "method_pointers": ["sampler", "polish"]}}"#;

#[test]
fn sequential_hybrid_runs_one_job_per_seed_solution() {
    init_logging();
    let top = run_serial(description("chain", &[SAMPLER, POLISH, CHAIN], QUADRATIC));
    let AnyIterator::SeqHybrid(chain) = &top else { panic!("expected a sequential hybrid") };
    assert_eq!(chain.round_job_counts(), &[1, 4]);
    assert_eq!(top.as_algorithm().final_solutions().len(), 4);
    for solution in top.as_algorithm().final_solutions() {
        assert_abs_diff_eq!(solution.variables[0], 0.3, epsilon = 1e-3);
        assert_abs_diff_eq!(solution.variables[1], -0.4, epsilon = 1e-3);
    }
}

#[test]
fn sequential_hybrid_on_three_ranks_shares_its_solutions() {
    let summaries = run_local(description("chain", &[SAMPLER, POLISH, CHAIN], QUADRATIC), 3).unwrap();
    assert_eq!(summaries.len(), 3);
    assert_eq!(summaries[0].final_solutions.len(), 4);
    assert_shared(&summaries);
    let evaluations: usize = summaries.iter().map(|s| s.evaluations).sum();
    assert!(evaluations > 17);
}

const MULTI_START: &str = r#"{"id": "ms", "method": {"type": "multi_start", "method_name": "pattern_search",
    "starting_points": [[0.9, 0.9], [-0.9, -0.9]], "random_starts": 2, "seed": 5}}"#;

#[test]
fn multi_start_with_a_dedicated_master() {
    init_logging();
    let summaries = run_local(description("ms", &[MULTI_START], QUADRATIC), 3).unwrap();
    assert_shared(&summaries);
    let finals = &summaries[0].final_solutions;
    assert_eq!(finals.len(), 4);
    for solution in finals {
        assert_abs_diff_eq!(solution.variables[0], 0.3, epsilon = 1e-3);
        assert_abs_diff_eq!(solution.variables[1], -0.4, epsilon = 1e-3);
    }
    // four jobs on three ranks: rank 0 only dispatches
    assert_eq!(summaries[0].instantiated_models, 0);
    assert_eq!(summaries[0].evaluations, 0);
    assert!(summaries[1..].iter().all(|s| s.instantiated_models == 1 && s.evaluations > 0));
}

#[test]
fn idle_ranks_build_no_models() {
    let ms = r#"{"id": "ms", "scheduling": {"iterator_scheduling": "peer"},
        "method": {"type": "multi_start", "method_name": "pattern_search", "starting_points": [[0.9, 0.9], [-0.9, 0.5]]}}"#;
    let summaries = run_local(description("ms", &[ms], QUADRATIC), 4).unwrap();
    assert_shared(&summaries);
    assert_eq!(summaries[0].final_solutions.len(), 2);
    for idle in &summaries[2..] {
        assert_eq!(idle.instantiated_models, 0);
        assert_eq!(idle.evaluations, 0);
    }
    assert!(summaries[..2].iter().all(|s| s.instantiated_models == 1));
}

#[test]
fn pareto_set_reweights_from_the_same_reference_point() {
    let pareto = r#"{"id": "front", "method": {"type": "pareto_set", "method_name": "pattern_search",
        "weight_sets": [[1, 0], [0, 1], [0.5, 0.5]]}}"#;
    let summaries = run_local(description("front", &[pareto], PARABOLOIDS), 2).unwrap();
    assert_shared(&summaries);
    let finals = &summaries[0].final_solutions;
    assert_eq!(finals.len(), 3);
    for (solution, expected) in finals.iter().zip([0.0, 1.0, 0.5]) {
        assert_abs_diff_eq!(solution.variables[0], expected, epsilon = 1e-3);
        assert_abs_diff_eq!(solution.variables[1], expected, epsilon = 1e-3);
    }
}

#[test]
fn pareto_weights_must_match_objectives() {
    let pareto = r#"{"id": "front", "method": {"type": "pareto_set", "method_name": "pattern_search",
        "weight_sets": [[1, 0, 0]]}}"#;
    let result = Environment::new(description("front", &[pareto], PARABOLOIDS), SerialComm);
    assert!(matches!(result, Err(SchedError::Spec(_))));
}

#[test]
fn nested_multi_start_over_a_sequential_hybrid() {
    init_logging();
    let sampler = r#"{"id": "sampler", "method": {"type": "random_sampling", "samples": 16, "final_solutions": 2}}"#;
    let ms = r#"{"id": "ms", "method": {"type": "multi_start", "method_pointer": "chain",
        "starting_points": [[0.9, 0.9], [-0.9, -0.9]]}}"#;
    let summaries = run_local(description("ms", &[sampler, POLISH, CHAIN, ms], QUADRATIC), 4).unwrap();
    assert_eq!(summaries.len(), 4);
    assert_shared(&summaries);
    assert_eq!(summaries[0].final_solutions.len(), 4);
    assert!(summaries[0].best.as_ref().is_some_and(|b| b.objective() < 1e-6));
}

#[test]
fn embedded_hybrid_runs_the_global_method() {
    let embedded = r#"{"id": "embed", "method": {"type": "hybrid_embedded",
        "global_method_name": "random_sampling", "local_method_name": "pattern_search",
        "local_search_probability": 1.7}}"#;
    let top = run_serial(description("embed", &[embedded], QUADRATIC));
    let AnyIterator::EmbedHybrid(embed) = &top else { panic!("expected an embedded hybrid") };
    assert_eq!(embed.local_search_probability(), 1.0);
    // default sampling keeps an eighth of its 64 samples
    assert_eq!(top.as_algorithm().final_solutions().len(), 8);

    let summaries = run_local(description("embed", &[embedded], QUADRATIC), 2).unwrap();
    assert_shared(&summaries);
    assert_eq!(summaries[0].final_solutions.len(), 8);
}

#[test]
fn collaborative_hybrid_unions_its_methods() {
    let collab = r#"{"id": "team", "method": {"type": "hybrid_collaborative",
        "method_names": ["pattern_search", "random_sampling"], "model_pointers": ["quad"]}}"#;
    let summaries = run_local(description("team", &[collab], QUADRATIC), 3).unwrap();
    assert_shared(&summaries);
    let finals = &summaries[0].final_solutions;
    assert_eq!(finals.len(), 9);
    assert_abs_diff_eq!(finals[0].variables[0], 0.3, epsilon = 1e-3);
}

#[test]
fn stochastic_jobs_do_not_depend_on_server_placement() {
    let ms = r#"{"id": "ms", "method": {"type": "multi_start", "method_pointer": "leaf",
        "starting_points": [[0.9, 0.9], [-0.9, -0.9], [0.5, -0.5], [-0.5, 0.5]]}}"#;
    let leaves = [
        r#"{"id": "leaf", "method": {"type": "random_sampling", "samples": 5, "seed": 3, "final_solutions": 1}}"#,
        r#"{"id": "leaf", "method": {"type": "evolution_strategy", "generations": 5, "seed": 3}}"#,
    ];
    for leaf in leaves {
        let description = description("ms", &[leaf, ms], QUADRATIC);
        let serial = run_local(Arc::clone(&description), 1).unwrap();
        let distinct = serial[0].final_solutions.iter().filter(|p| *p != &serial[0].final_solutions[0]).count();
        assert!(distinct > 0);
        // three ranks schedule from a master, four run one peer job each
        for ranks in [3, 4] {
            let summaries = run_local(Arc::clone(&description), ranks).unwrap();
            assert_shared(&summaries);
            assert_eq!(summaries[0].final_solutions, serial[0].final_solutions);
        }
    }
}

#[test]
fn collaborative_peers_build_only_their_own_methods() {
    let team = |scheduling: &str| {
        format!(
            r#"{{"id": "team", "scheduling": {{"iterator_scheduling": "{scheduling}"}}, "method": {{"type": "hybrid_collaborative",
                "method_names": ["pattern_search", "random_sampling", "newton_cg"]}}}}"#
        )
    };
    let peer = team("peer");
    let summaries = run_local(description("team", &[peer.as_str()], QUADRATIC), 2).unwrap();
    assert_shared(&summaries);
    let models: Vec<usize> = summaries.iter().map(|s| s.instantiated_models).collect();
    assert_eq!(models, vec![2, 1]);

    let master = team("master");
    let summaries = run_local(description("team", &[master.as_str()], QUADRATIC), 3).unwrap();
    assert_shared(&summaries);
    let models: Vec<usize> = summaries.iter().map(|s| s.instantiated_models).collect();
    assert_eq!(models, vec![0, 3, 3]);
}

#[test]
fn adaptive_threshold_is_clamped() {
    for (given, expected) in [(1.5, 1.0), (-0.2, 0.0), (0.5, 0.5)] {
        let chain = format!(
            r#"{{"id": "chain", "method": {{"type": "hybrid_sequential", "method_names": ["random_sampling", "pattern_search"],
                "adaptive": true, "progress_threshold": {given}, "batch_iterations": 8}}}}"#
        );
        let top = run_serial(description("chain", &[chain.as_str()], QUADRATIC));
        let AnyIterator::SeqHybrid(seq) = &top else { panic!("expected a sequential hybrid") };
        assert_eq!(seq.progress_threshold(), expected);
        assert!(!top.as_algorithm().final_solutions().is_empty());
    }
}

/// Evaluations of a one-method adaptive chain over random sampling. Each batch evaluates
/// its starting point and `batch` samples.
fn adaptive_evaluations(threshold: f64, batch: usize, cycles: usize) -> usize {
    let sampler = r#"{"id": "batch", "method": {"type": "random_sampling", "samples": 100, "final_solutions": 1}}"#;
    let chain = format!(
        r#"{{"id": "chain", "method": {{"type": "hybrid_sequential", "method_pointers": ["batch"], "adaptive": true,
            "progress_threshold": {threshold}, "batch_iterations": {batch}, "max_adaptive_cycles": {cycles}}}}}"#
    );
    let mut env = Environment::new(description("chain", &[sampler, chain.as_str()], QUADRATIC), SerialComm).unwrap();
    env.execute().unwrap().evaluations
}

#[test]
fn adaptive_hybrid_repeats_until_the_cycle_cap() {
    assert_eq!(adaptive_evaluations(0.0, 4, 3), 15);
    assert_eq!(adaptive_evaluations(0.0, 7, 2), 16);
    assert_eq!(adaptive_evaluations(0.0, 4, 1), 5);
}

#[test]
fn adaptive_hybrid_moves_on_once_progress_drops() {
    // the first batch has nothing to improve on and counts as full progress
    assert_eq!(adaptive_evaluations(1.0, 4, 5), 10);
}

#[test]
fn adaptive_hybrid_rejects_master_scheduling() {
    let chain = r#"{"id": "chain", "scheduling": {"iterator_scheduling": "master"},
        "method": {"type": "hybrid_sequential", "method_names": ["random_sampling", "pattern_search"], "adaptive": true}}"#;
    let result = run_local(description("chain", &[chain], QUADRATIC), 3);
    assert!(matches!(result, Err(SchedError::CapabilityMismatch(_))));
}

#[test]
fn pointer_and_name_lists_are_mutually_exclusive() {
    let both = r#"{"id": "chain", "method": {"type": "hybrid_sequential",
        "method_pointers": ["polish"], "method_names": ["pattern_search"]}}"#;
    let neither = r#"{"id": "chain", "method": {"type": "hybrid_sequential"}}"#;
    for chain in [both, neither] {
        let result = Environment::new(description("chain", &[POLISH, chain], QUADRATIC), SerialComm);
        assert!(matches!(result, Err(SchedError::Spec(_))));
    }
}

#[test]
fn a_failing_job_aborts_every_rank() {
    let mut model: metasched::config::ModelBlock = serde_json::from_str(QUADRATIC).unwrap();
    if let metasched::config::TestFunction::Quadratic { center, .. } = &mut model.function {
        center[0] = f64::NAN;
    }
    let ms = serde_json::from_str(MULTI_START).unwrap();
    let description = Arc::new(ProblemDescription { top_method: "ms".into(), methods: vec![ms], models: vec![model] });
    match run_local(description, 3) {
        Err(SchedError::Model(msg)) => assert!(msg.contains("NaN")),
        other => panic!("unexpected {other:?}"),
    }
}
