use std::collections::HashMap;
use std::sync::Arc;

use crate::types::Fuzzlet;

/// One scoring strategy for candidate fuzzlets. Returns a raw (unbalanced)
/// score per fuzzlet, positionally aligned with the input slice.
pub trait ScoreFactor: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, fuzzlets: &[Arc<Fuzzlet>]) -> Vec<f64>;
}

/// Gives each task equal aggregate mass regardless of how many fuzzlets it
/// contributes: a fuzzlet scores the inverse of its task's fuzzlet count.
pub struct TaskBalanceFactor;

impl ScoreFactor for TaskBalanceFactor {
    fn name(&self) -> &'static str {
        "task-balance"
    }

    fn score(&self, fuzzlets: &[Arc<Fuzzlet>]) -> Vec<f64> {
        let mut per_task: HashMap<&str, usize> = HashMap::new();
        for fuzzlet in fuzzlets {
            *per_task.entry(fuzzlet.task_id.as_str()).or_default() += 1;
        }
        fuzzlets
            .iter()
            .map(|f| 1.0 / per_task[f.task_id.as_str()] as f64)
            .collect()
    }
}

/// Address-sanitizer runs find the bugs we care most about; everything else
/// gets baseline weight.
pub struct SanitizerPriorityFactor;

impl ScoreFactor for SanitizerPriorityFactor {
    fn name(&self) -> &'static str {
        "sanitizer-priority"
    }

    fn score(&self, fuzzlets: &[Arc<Fuzzlet>]) -> Vec<f64> {
        fuzzlets
            .iter()
            .map(|f| if f.sanitizer == "address" { 5.0 } else { 1.0 })
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_fuzzlet(task: &str, harness: &str, sanitizer: &str) -> Arc<Fuzzlet> {
    Arc::new(Fuzzlet {
        task_id: task.to_string(),
        harness: harness.to_string(),
        sanitizer: sanitizer.to_string(),
        fuzz_engine: "aflpp".to_string(),
        artifact_path: format!("/artifacts/{task}/{harness}"),
    })
}
