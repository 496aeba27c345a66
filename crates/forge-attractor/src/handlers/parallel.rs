use crate::{
    AttractorError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext, handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::thread;

/// One branch's outcome, whether synthesized from context (fixture/unit-test
/// path) or produced by a real isolated-worktree sub-traversal
/// (`parallel_dispatch`, used by live git-backed runs).
#[derive(Clone, Debug)]
pub(crate) struct BranchResult {
    pub(crate) branch_id: String,
    pub(crate) target_node: String,
    pub(crate) status: NodeStatus,
    pub(crate) score: f64,
    pub(crate) notes: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum JoinPolicy {
    WaitAll,
    FirstSuccess,
    KOfN,
    Quorum,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorPolicy {
    Continue,
    FailFast,
    Ignore,
}

#[derive(Debug, Default)]
pub struct ParallelHandler;

#[async_trait]
impl NodeHandler for ParallelHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let branches: Vec<(String, String)> = graph
            .outgoing_edges(&node.id)
            .map(|edge| {
                (
                    edge.attrs
                        .get_str("label")
                        .filter(|label| !label.trim().is_empty())
                        .unwrap_or(edge.to.as_str())
                        .to_string(),
                    edge.to.clone(),
                )
            })
            .collect();

        if branches.is_empty() {
            return Ok(NodeOutcome::failure(format!(
                "parallel node '{}' has no outgoing branches",
                node.id
            )));
        }

        let max_parallel = parse_usize_attr(node, "max_parallel", 4).max(1);
        let results = run_branch_batches(branches, context, max_parallel)?;

        Ok(aggregate_branch_results(node, results))
    }
}

/// Shared join/error-policy aggregation (§4.8): consumed both by the
/// in-process simulation above (unit/fixture runs with no git config) and by
/// `parallel_dispatch`'s real isolated-worktree branches (live git-backed
/// runs). `results` need not be pre-sorted; the deterministic tie-break
/// (branch_key order) is applied here.
pub(crate) fn aggregate_branch_results(node: &Node, mut results: Vec<BranchResult>) -> NodeOutcome {
    let join_policy = parse_join_policy(node);
    let error_policy = parse_error_policy(node);
    let quorum_needed = quorum_target_count(node, results.len());
    let k_needed = k_of_n_target_count(node, results.len());

    results.sort_by(|left, right| left.branch_id.cmp(&right.branch_id));

    // `ignore` drops failed branches from the aggregated outcome before the
    // join policy ever sees them (§4.8 error policy).
    let evaluated: Vec<&BranchResult> = if error_policy == ErrorPolicy::Ignore {
        results
            .iter()
            .filter(|result| result.status.is_success_like())
            .collect()
    } else {
        results.iter().collect()
    };

    let success_count = evaluated
        .iter()
        .filter(|result| result.status.is_success_like())
        .count();
    let fail_count = evaluated
        .iter()
        .filter(|result| result.status == NodeStatus::Fail)
        .count();

    // `fail_fast` (§4.8 error policy) overrides the join policy outright:
    // any branch failure makes the node outcome `fail`, regardless of how
    // many branches succeeded. The live dispatcher additionally cancels
    // remaining in-flight branches on the first observed failure; here
    // (post-hoc aggregation over already-collected results) the override
    // only needs to affect the final status.
    let (status, notes) = if error_policy == ErrorPolicy::FailFast && fail_count > 0 {
        (
            NodeStatus::Fail,
            format!(
                "fail_fast policy: {} of {} branches failed, aborting",
                fail_count,
                evaluated.len()
            ),
        )
    } else {
        match join_policy {
            JoinPolicy::WaitAll => {
                if fail_count == 0 {
                    (
                        NodeStatus::Success,
                        format!("all {} branches completed successfully", evaluated.len()),
                    )
                } else if success_count > 0 {
                    (
                        NodeStatus::PartialSuccess,
                        format!(
                            "wait_all policy: {} of {} branches failed",
                            fail_count,
                            evaluated.len()
                        ),
                    )
                } else {
                    (
                        NodeStatus::Fail,
                        format!("wait_all policy failed: all {} branches failed", fail_count),
                    )
                }
            }
            JoinPolicy::FirstSuccess => {
                if success_count > 0 {
                    (
                        NodeStatus::Success,
                        format!(
                            "first_success policy satisfied: {} successful branches",
                            success_count
                        ),
                    )
                } else {
                    (
                        NodeStatus::Fail,
                        "first_success policy failed: no successful branch".to_string(),
                    )
                }
            }
            JoinPolicy::KOfN => {
                if success_count >= k_needed {
                    (
                        NodeStatus::Success,
                        format!(
                            "k_of_n policy satisfied: {} successful branches (required {})",
                            success_count, k_needed
                        ),
                    )
                } else {
                    (
                        NodeStatus::Fail,
                        format!(
                            "k_of_n policy failed: {} successful branches (required {})",
                            success_count, k_needed
                        ),
                    )
                }
            }
            JoinPolicy::Quorum => {
                if success_count >= quorum_needed {
                    (
                        NodeStatus::Success,
                        format!(
                            "quorum policy satisfied: {} successful branches (required {})",
                            success_count, quorum_needed
                        ),
                    )
                } else {
                    (
                        NodeStatus::Fail,
                        format!(
                            "quorum policy failed: {} successful branches (required {})",
                            success_count, quorum_needed
                        ),
                    )
                }
            }
        }
    };

    let mut updates = RuntimeContext::new();
    updates.insert(
        "parallel.results".to_string(),
        Value::Array(evaluated.iter().map(|r| branch_result_to_value(r)).collect()),
    );
    updates.insert(
        "parallel.branch_count".to_string(),
        Value::Number((evaluated.len() as u64).into()),
    );
    updates.insert(
        "parallel.success_count".to_string(),
        Value::Number((success_count as u64).into()),
    );
    updates.insert(
        "parallel.fail_count".to_string(),
        Value::Number((fail_count as u64).into()),
    );
    updates.insert(
        "parallel.join_policy".to_string(),
        Value::String(join_policy.as_str().to_string()),
    );
    updates.insert(
        "parallel.error_policy".to_string(),
        Value::String(error_policy.as_str().to_string()),
    );

    NodeOutcome {
        status,
        notes: Some(notes),
        context_updates: updates,
        preferred_label: None,
        suggested_next_ids: Vec::new(),
    }
}

/// `true` only for `join_policy=first_success`; used by `parallel_dispatch`
/// to decide whether a winning branch's worktree should be fast-forward
/// merged onto the main run branch (§4.4 step 6).
pub(crate) fn join_policy_is_first_success(node: &Node) -> bool {
    parse_join_policy(node) == JoinPolicy::FirstSuccess
}

impl JoinPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::WaitAll => "wait_all",
            Self::FirstSuccess => "first_success",
            Self::KOfN => "k_of_n",
            Self::Quorum => "quorum",
        }
    }
}

impl ErrorPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::FailFast => "fail_fast",
            Self::Ignore => "ignore",
        }
    }
}

fn run_branch_batches(
    branches: Vec<(String, String)>,
    context: &RuntimeContext,
    max_parallel: usize,
) -> Result<Vec<BranchResult>, AttractorError> {
    let mut out = Vec::with_capacity(branches.len());
    for batch in branches.chunks(max_parallel) {
        let mut handles = Vec::with_capacity(batch.len());
        for (branch_id, target_node) in batch {
            let local_context = branch_context(context, branch_id, target_node);
            let branch_id = branch_id.clone();
            let target_node = target_node.clone();
            handles.push(thread::spawn(move || {
                resolve_branch_result(&branch_id, &target_node, &local_context)
            }));
        }

        for handle in handles {
            let branch_result = handle.join().map_err(|_| {
                AttractorError::Runtime("parallel branch thread panicked".to_string())
            })?;
            out.push(branch_result);
        }
    }

    Ok(out)
}

fn branch_context(base: &RuntimeContext, branch_id: &str, target_node: &str) -> RuntimeContext {
    let mut cloned = base.clone();
    cloned.insert(
        "work.branch_id".to_string(),
        Value::String(branch_id.to_string()),
    );
    cloned.insert(
        "work.branch_target".to_string(),
        Value::String(target_node.to_string()),
    );
    cloned
}

fn resolve_branch_result(
    branch_id: &str,
    target_node: &str,
    context: &RuntimeContext,
) -> BranchResult {
    let status = context
        .get("parallel.branch_outcomes")
        .and_then(Value::as_object)
        .and_then(|entries| entries.get(branch_id))
        .and_then(Value::as_str)
        .and_then(parse_status)
        .or_else(|| {
            context
                .get("parallel.branch_outcomes")
                .and_then(Value::as_object)
                .and_then(|entries| entries.get(target_node))
                .and_then(Value::as_str)
                .and_then(parse_status)
        })
        .unwrap_or(NodeStatus::Success);

    let score = context
        .get("parallel.branch_scores")
        .and_then(Value::as_object)
        .and_then(|entries| entries.get(branch_id))
        .and_then(Value::as_f64)
        .or_else(|| {
            context
                .get("parallel.branch_scores")
                .and_then(Value::as_object)
                .and_then(|entries| entries.get(target_node))
                .and_then(Value::as_f64)
        })
        .unwrap_or(0.0);

    let notes = context
        .get("parallel.branch_notes")
        .and_then(Value::as_object)
        .and_then(|entries| entries.get(branch_id))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    BranchResult {
        branch_id: branch_id.to_string(),
        target_node: target_node.to_string(),
        status,
        score,
        notes,
    }
}

fn parse_join_policy(node: &Node) -> JoinPolicy {
    let value = attr_str(node, &["join_policy"]).unwrap_or("wait_all");
    match value.trim() {
        "first_success" => JoinPolicy::FirstSuccess,
        "k_of_n" => JoinPolicy::KOfN,
        "quorum" => JoinPolicy::Quorum,
        _ => JoinPolicy::WaitAll,
    }
}

pub(crate) fn parse_error_policy(node: &Node) -> ErrorPolicy {
    let value = attr_str(node, &["error_policy"]).unwrap_or("continue");
    match value.trim() {
        "fail_fast" => ErrorPolicy::FailFast,
        "ignore" => ErrorPolicy::Ignore,
        _ => ErrorPolicy::Continue,
    }
}

fn k_of_n_target_count(node: &Node, branch_count: usize) -> usize {
    for candidate in attr_key_variants("k") {
        if let Some(explicit) = node.attrs.get(&candidate).and_then(|value| match value {
            crate::AttrValue::Integer(value) if *value >= 1 => Some(*value as usize),
            crate::AttrValue::String(value) => value.parse::<usize>().ok(),
            _ => None,
        }) {
            return explicit.min(branch_count).max(1);
        }
    }
    branch_count.max(1)
}

pub(crate) fn parse_usize_attr(node: &Node, key: &str, default: usize) -> usize {
    for candidate in attr_key_variants(key) {
        let Some(value) = node.attrs.get(&candidate) else {
            continue;
        };
        return match value {
            crate::AttrValue::Integer(value) if *value >= 0 => *value as usize,
            crate::AttrValue::String(value) => value.parse::<usize>().unwrap_or(default),
            _ => default,
        };
    }
    default
}

fn parse_f64_attr(node: &Node, key: &str, default: f64) -> f64 {
    for candidate in attr_key_variants(key) {
        let Some(value) = node.attrs.get(&candidate) else {
            continue;
        };
        return match value {
            crate::AttrValue::Float(value) => *value,
            crate::AttrValue::Integer(value) => *value as f64,
            crate::AttrValue::String(value) => value.parse::<f64>().unwrap_or(default),
            _ => default,
        };
    }
    default
}

fn quorum_target_count(node: &Node, branch_count: usize) -> usize {
    for candidate in attr_key_variants("quorum_count") {
        if let Some(explicit) = node.attrs.get(&candidate).and_then(|value| match value {
            crate::AttrValue::Integer(value) if *value >= 1 => Some(*value as usize),
            crate::AttrValue::String(value) => value.parse::<usize>().ok(),
            _ => None,
        }) {
            return explicit.min(branch_count).max(1);
        }
    }

    let ratio = parse_f64_attr(node, "quorum_ratio", 0.5).clamp(0.0, 1.0);
    ((branch_count as f64) * ratio).ceil().max(1.0) as usize
}

fn attr_key_variants(key: &str) -> Vec<String> {
    vec![key.to_string(), key.replace('.', "_")]
}

fn attr_str<'a>(node: &'a Node, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(value) = node.attrs.get_str(key) {
            return Some(value);
        }
        let underscored = key.replace('.', "_");
        if let Some(value) = node.attrs.get_str(&underscored) {
            return Some(value);
        }
    }
    None
}

fn parse_status(value: &str) -> Option<NodeStatus> {
    match value.trim() {
        "success" => Some(NodeStatus::Success),
        "partial_success" => Some(NodeStatus::PartialSuccess),
        "retry" => Some(NodeStatus::Retry),
        "fail" => Some(NodeStatus::Fail),
        _ => None,
    }
}

pub(crate) fn branch_result_to_value(result: &BranchResult) -> Value {
    json!({
        "branch_id": result.branch_id,
        "target_node": result.target_node,
        "status": result.status.as_str(),
        "score": result.score,
        "notes": result.notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dot;

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_handler_wait_all_expected_success_and_results() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component, join_policy="wait_all"]
                p -> a
                p -> b
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("p").expect("node should exist");

        let outcome = ParallelHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(
            outcome
                .context_updates
                .get("parallel.branch_count")
                .and_then(Value::as_u64),
            Some(2)
        );
        assert!(outcome.context_updates.contains_key("parallel.results"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_handler_wait_all_mixed_outcomes_expected_partial_success() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component, join_policy="wait_all"]
                p -> a
                p -> b
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("p").expect("node should exist");
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.branch_outcomes".to_string(),
            json!({"a": "fail", "b": "success"}),
        );

        let outcome = ParallelHandler
            .execute(node, &context, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::PartialSuccess);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_handler_first_success_with_failures_expected_success() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component, join_policy="first_success"]
                p -> a
                p -> b
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("p").expect("node should exist");
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.branch_outcomes".to_string(),
            json!({"a": "fail", "b": "success"}),
        );

        let outcome = ParallelHandler
            .execute(node, &context, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::Success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_handler_ignore_error_policy_drops_failed_branches() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component, join_policy="wait_all", error_policy="ignore"]
                p -> a
                p -> b
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("p").expect("node should exist");
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.branch_outcomes".to_string(),
            json!({"a": "fail", "b": "success"}),
        );

        let outcome = ParallelHandler
            .execute(node, &context, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(
            outcome
                .context_updates
                .get("parallel.branch_count")
                .and_then(Value::as_u64),
            Some(1)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_handler_fail_fast_error_policy_overrides_wait_all_partial_success() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component, join_policy="wait_all", error_policy="fail_fast"]
                p -> a
                p -> b
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("p").expect("node should exist");
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.branch_outcomes".to_string(),
            json!({"a": "fail", "b": "success"}),
        );

        let outcome = ParallelHandler
            .execute(node, &context, &graph)
            .await
            .expect("execution should succeed");

        // wait_all alone would yield partial_success here (one of two
        // branches failed); fail_fast overrides that to an outright fail.
        assert_eq!(outcome.status, NodeStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_handler_fail_fast_error_policy_no_failures_expected_success() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component, join_policy="wait_all", error_policy="fail_fast"]
                p -> a
                p -> b
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("p").expect("node should exist");
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.branch_outcomes".to_string(),
            json!({"a": "success", "b": "success"}),
        );

        let outcome = ParallelHandler
            .execute(node, &context, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::Success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parallel_handler_quorum_expected_fail_when_not_met() {
        let graph = parse_dot(
            r#"
            digraph G {
                p [shape=component, join_policy="quorum", quorum_count=2]
                p -> a
                p -> b
                p -> c
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("p").expect("node should exist");
        let mut context = RuntimeContext::new();
        context.insert(
            "parallel.branch_outcomes".to_string(),
            json!({"a": "success", "b": "fail", "c": "fail"}),
        );

        let outcome = ParallelHandler
            .execute(node, &context, &graph)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, NodeStatus::Fail);
    }
}
