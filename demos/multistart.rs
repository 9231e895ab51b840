use metasched::config::ProblemDescription;
use metasched::environment::run_local;
use std::sync::Arc;

// Multi-start pattern search on Rastrigin, each start polished by a sampling + pattern
// search chain, on four thread ranks.
const PROBLEM: &str = r#"{
    "top_method": "starts",
    "methods": [
        {"id": "starts", "method": {"type": "multi_start", "method_pointer": "chain",
                                    "random_starts": 4, "seed": 11}},
        {"id": "chain", "method": {"type": "hybrid_sequential", "method_pointers": ["sample", "polish"]}},
        {"id": "sample", "method": {"type": "random_sampling", "samples": 200, "final_solutions": 3}},
        {"id": "polish", "method": {"type": "pattern_search", "min_step": 1e-8}}
    ],
    "models": [
        {"id": "rastrigin", "function": {"type": "rastrigin"},
         "lower_bounds": [-5.12, -5.12, -5.12], "upper_bounds": [5.12, 5.12, 5.12],
         "initial_point": [3.0, -2.0, 1.0]}
    ]
}"#;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let description = Arc::new(ProblemDescription::from_json(PROBLEM).unwrap());
    let summaries = run_local(description, 4).unwrap();

    let lead = &summaries[0];
    println!("{} final solutions", lead.final_solutions.len());
    if let Some(best) = &lead.best {
        println!("best f = {:.6e} at {:?}", best.objective(), best.variables);
    }
    for s in &summaries {
        println!("rank {}: {} evaluations, {} model(s)", s.rank, s.evaluations, s.instantiated_models);
    }
}
