//! Job dependency solving: cycle detection, unknown-dependency checks,
//! deterministic ordering, and the Mermaid graph for the lock header.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::diag::{Category, CompileError, diagnostic};

/// A job to be ordered. `layer` fixes the emission band: synthesized jobs
/// occupy layers 0..=5 in pipeline order, user jobs share the final layer.
#[derive(Debug, Clone)]
pub struct JobNode {
    pub name: String,
    pub needs: Vec<String>,
    pub layer: usize,
}

/// Layer indices for synthesized jobs.
pub mod layer {
    pub const PRE_ACTIVATION: usize = 0;
    pub const ACTIVATION: usize = 1;
    pub const AGENT: usize = 2;
    pub const DETECTION: usize = 3;
    pub const SAFE_OUTPUT: usize = 4;
    pub const CONCLUSION: usize = 5;
    pub const USER: usize = 6;
}

#[derive(Debug, Clone)]
pub struct SolvedGraph {
    /// Emission order: layer by layer, alphabetical within a layer, user
    /// jobs last (topologically ordered among themselves).
    pub order: Vec<String>,
    /// Mermaid lines for the lock header: `graph LR` plus one line per
    /// edge, sorted.
    pub mermaid: Vec<String>,
}

/// Solve the job graph.
pub fn solve(src_path: &Path, jobs: &[JobNode]) -> Result<SolvedGraph, CompileError> {
    let names: BTreeSet<&str> = jobs.iter().map(|j| j.name.as_str()).collect();

    // Unknown `needs:` references are a complete check: every name must be
    // an emitted job.
    for job in jobs {
        for need in &job.needs {
            if !names.contains(need.as_str()) {
                return Err(CompileError::Graph(
                    diagnostic(
                        Category::Graph,
                        src_path,
                        format!("job `{}` needs unknown job `{need}`", job.name),
                    )
                    .at(format!("jobs.{}.needs", job.name))
                    .suggest("declare the dependency job or remove the `needs:` entry"),
                ));
            }
        }
    }

    // Kahn's algorithm with a deterministic ready set ordered by
    // (layer, name).
    let by_name: BTreeMap<&str, &JobNode> = jobs.iter().map(|j| (j.name.as_str(), j)).collect();
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for job in jobs {
        let unique_needs: BTreeSet<&str> = job.needs.iter().map(String::as_str).collect();
        indegree.insert(&job.name, unique_needs.len());
        for need in unique_needs {
            dependents.entry(need).or_default().push(&job.name);
        }
    }

    let mut ready: BTreeSet<(usize, &str)> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| (by_name[name].layer, *name))
        .collect();

    let mut order: Vec<String> = Vec::with_capacity(jobs.len());
    while let Some(&(job_layer, name)) = ready.iter().next() {
        ready.remove(&(job_layer, name));
        order.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            for dependent in deps {
                let deg = indegree
                    .get_mut(dependent)
                    .expect("dependent indegree present");
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    ready.insert((by_name[dependent].layer, dependent));
                }
            }
        }
    }

    if order.len() != jobs.len() {
        let stuck: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(name, _)| *name)
            .collect();
        let cycle = describe_cycle(&stuck, &by_name);
        return Err(CompileError::Graph(
            diagnostic(
                Category::Graph,
                src_path,
                format!("cycle detected among jobs: {cycle}"),
            )
            .at("jobs"),
        ));
    }

    // Mermaid edges from the final edge set, deterministic.
    let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
    for job in jobs {
        for need in &job.needs {
            edges.insert((need.clone(), job.name.clone()));
        }
    }
    let mut mermaid = vec!["graph LR".to_string()];
    for (from, to) in edges {
        mermaid.push(format!("  {from} --> {to}"));
    }

    Ok(SolvedGraph { order, mermaid })
}

/// Walk `needs` edges inside the stuck set until a repeat, producing
/// `a -> b -> a`.
fn describe_cycle(stuck: &BTreeSet<&str>, by_name: &BTreeMap<&str, &JobNode>) -> String {
    let Some(start) = stuck.iter().next() else {
        return String::new();
    };
    let mut path: Vec<&str> = vec![start];
    let mut current = *start;
    loop {
        let next = by_name[current]
            .needs
            .iter()
            .map(String::as_str)
            .find(|n| stuck.contains(n));
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|&n| n == next) {
            let mut names: Vec<&str> = path[pos..].to_vec();
            names.push(next);
            return names.join(" -> ");
        }
        path.push(next);
        current = next;
    }
    path.join(" -> ")
}
