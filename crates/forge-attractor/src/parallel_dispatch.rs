//! Live, git-backed execution of a `component` fan-out node's branches
//! (C8). Each outgoing branch gets its own worktree on a dedicated branch
//! (§4.4 step 4), sub-traverses its subgraph up to the node's join target
//! under a bounded worker pool, and reports back a `BranchResult` that
//! feeds the same `aggregate_branch_results` policy evaluation the
//! in-process `ParallelHandler` fixture path uses.
//!
//! This path only runs when the engine is configured with a `GitRunConfig`
//! (`RunConfig::git`); fixture/unit-test runs without git configured keep
//! using `handlers::parallel::ParallelHandler`'s in-context simulation.

use crate::classify::{self, FailureClass};
use crate::handlers::parallel::{
    aggregate_branch_results, branch_result_to_value, join_policy_is_first_success,
    parse_error_policy, parse_usize_attr, BranchResult, ErrorPolicy,
};
use crate::{
    AttractorError, GitWorktreeManager, Graph, Node, NodeExecutor, NodeOutcome, NodeStatus,
    RuntimeContext, build_retry_policy, select_next_edge, RetryBackoffConfig,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Outcome of dispatching a `component` node through real isolated
/// worktrees, plus enough bookkeeping for the caller to fast-forward merge
/// a winner and clean up every branch's worktree/branch.
pub struct ParallelDispatchOutcome {
    pub node_outcome: NodeOutcome,
    pub branches: Vec<DispatchedBranch>,
    pub winner_branch_name: Option<String>,
}

pub struct DispatchedBranch {
    pub branch_key: String,
    pub start_node_id: String,
    pub status: NodeStatus,
    pub branch_name: String,
    pub worktree_path: PathBuf,
}

/// Runs every outgoing branch of `fan_node` to completion in its own
/// worktree, then aggregates per the node's `join_policy`/`error_policy`.
///
/// Branches never mutate the run's shared context directly (§5): each gets
/// a private clone seeded from `base_context` plus `work.branch_id` /
/// `work.branch_target` markers, matching what the in-process simulation
/// exposes to fixture handlers.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_parallel_node(
    graph: &Graph,
    fan_node: &Node,
    base_context: &RuntimeContext,
    executor: &Arc<dyn NodeExecutor>,
    git: &GitWorktreeManager,
    run_id: &str,
    fan_base_sha: &str,
    scratch_root: &Path,
) -> Result<ParallelDispatchOutcome, AttractorError> {
    let branches: Vec<(String, String)> = graph
        .outgoing_edges(&fan_node.id)
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
        return Ok(ParallelDispatchOutcome {
            node_outcome: NodeOutcome::failure(format!(
                "parallel node '{}' has no outgoing branches",
                fan_node.id
            )),
            branches: Vec::new(),
            winner_branch_name: None,
        });
    }

    let join_node_id = branches
        .iter()
        .find_map(|(_, start_node_id)| find_branch_join_target(graph, start_node_id, fan_node));

    let max_parallel = parse_usize_attr(fan_node, "max_parallel", 4).max(1);
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    // §4.8 error_policy=fail_fast: the first branch-node failure flips this
    // flag, and every other branch's next suspension-point check (the top
    // of its per-node loop in `run_branch`) observes it and returns early
    // instead of running further nodes.
    let fail_fast = parse_error_policy(fan_node) == ErrorPolicy::FailFast;
    let cancel = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::with_capacity(branches.len());
    for (index, (branch_key, start_node_id)) in branches.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let graph = graph.clone();
        let executor = executor.clone();
        let git = git.clone();
        let base_context = base_context.clone();
        let join_node_id = join_node_id.clone();
        let run_id = run_id.to_string();
        let fan_node_id = fan_node.id.clone();
        let fan_base_sha = fan_base_sha.to_string();
        let cancel = cancel.clone();
        let worktree_path =
            scratch_root.join(format!("{}-{}", crate::sanitize_branch_segment(&branch_key), index));

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("dispatch semaphore never closed while branches are in flight");
            run_branch(
                &graph,
                &git,
                &run_id,
                &fan_node_id,
                branch_key,
                start_node_id,
                join_node_id.as_deref(),
                &fan_base_sha,
                worktree_path,
                base_context,
                executor,
                fail_fast,
                cancel,
            )
            .await
        }));
    }

    let mut dispatched = Vec::with_capacity(handles.len());
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let branch = handle
            .await
            .map_err(|_| AttractorError::Runtime("parallel branch task panicked".to_string()))??;
        results.push(BranchResult {
            branch_id: branch.branch_key.clone(),
            target_node: branch.start_node_id.clone(),
            status: branch.status,
            score: 0.0,
            notes: branch.notes.clone(),
        });
        dispatched.push(DispatchedBranch {
            branch_key: branch.branch_key,
            start_node_id: branch.start_node_id,
            status: branch.status,
            branch_name: branch.branch_name,
            worktree_path: branch.worktree_path,
        });
    }

    let node_outcome = aggregate_branch_results(fan_node, results);

    // Deterministic winner pick for first_success: the first branch (in
    // declaration order, i.e. the order edges were declared) whose status
    // is success-like. All branches already ran to completion above, so
    // this is a selection over finished results rather than a genuine
    // early-cancellation race; see DESIGN.md for the rationale.
    let winner_branch_name = if join_policy_is_first_success(fan_node) {
        dispatched
            .iter()
            .find(|branch| branch.status.is_success_like())
            .map(|branch| branch.branch_name.clone())
    } else {
        None
    };

    Ok(ParallelDispatchOutcome {
        node_outcome,
        branches: dispatched,
        winner_branch_name,
    })
}

struct BranchRunOutcome {
    branch_key: String,
    start_node_id: String,
    status: NodeStatus,
    notes: Option<String>,
    branch_name: String,
    worktree_path: PathBuf,
}

#[allow(clippy::too_many_arguments)]
async fn run_branch(
    graph: &Graph,
    git: &GitWorktreeManager,
    run_id: &str,
    fan_node_id: &str,
    branch_key: String,
    start_node_id: String,
    join_node_id: Option<&str>,
    base_sha: &str,
    worktree_path: PathBuf,
    base_context: RuntimeContext,
    executor: Arc<dyn NodeExecutor>,
    fail_fast: bool,
    cancel: Arc<AtomicBool>,
) -> Result<BranchRunOutcome, AttractorError> {
    let branch = git.create_parallel_branch(
        run_id,
        fan_node_id,
        &branch_key,
        base_sha,
        &worktree_path,
    )?;

    let mut context = base_context;
    context.insert(
        "work.branch_id".to_string(),
        Value::String(branch_key.clone()),
    );
    context.insert(
        "work.branch_target".to_string(),
        Value::String(start_node_id.clone()),
    );

    let mut current = start_node_id.clone();
    let mut last_outcome = NodeOutcome::success();
    let max_steps = graph.nodes.len().saturating_mul(2).max(4);

    for _ in 0..max_steps {
        if join_node_id == Some(current.as_str()) {
            break;
        }
        if cancel.load(Ordering::SeqCst) {
            return Ok(BranchRunOutcome {
                branch_key,
                start_node_id,
                status: NodeStatus::Fail,
                notes: Some(
                    "canceled: fail_fast error_policy triggered by a sibling branch".to_string(),
                ),
                branch_name: branch.branch_name,
                worktree_path,
            });
        }

        let Some(node) = graph.nodes.get(&current) else {
            return Ok(BranchRunOutcome {
                branch_key,
                start_node_id,
                status: NodeStatus::Fail,
                notes: Some(format!(
                    "parallel branch reached unknown node '{current}'"
                )),
                branch_name: branch.branch_name,
                worktree_path,
            });
        };

        let retry_policy = build_retry_policy(node, graph, RetryBackoffConfig::default());
        let mut outcome = NodeOutcome::failure("branch node never attempted");
        let mut structural_abort: Option<String> = None;
        for attempt in 1..=retry_policy.max_attempts {
            let candidate = match executor.execute(node, &context, graph).await {
                Ok(candidate) => candidate,
                Err(error) => NodeOutcome::failure(error.to_string()),
            };
            if candidate.status.is_success_like() {
                outcome = candidate;
                break;
            }

            let classification =
                classify::classify_provider_failure(&node.id, candidate.notes.as_deref().unwrap_or_default(), None);
            if classification.class == FailureClass::Structural {
                structural_abort = Some(format!(
                    "branch aborted at '{}': {}",
                    node.id, classification.reason
                ));
                break;
            }
            outcome = candidate;
            if classification.class.is_retriable() && attempt < retry_policy.max_attempts {
                continue;
            }
            break;
        }

        if let Some(reason) = structural_abort {
            return Ok(BranchRunOutcome {
                branch_key,
                start_node_id,
                status: NodeStatus::Fail,
                notes: Some(reason),
                branch_name: branch.branch_name,
                worktree_path,
            });
        }

        if fail_fast && outcome.status == NodeStatus::Fail {
            cancel.store(true, Ordering::SeqCst);
            return Ok(BranchRunOutcome {
                branch_key,
                start_node_id,
                status: NodeStatus::Fail,
                notes: outcome.notes.clone(),
                branch_name: branch.branch_name,
                worktree_path,
            });
        }

        context.extend(outcome.context_updates.clone());
        context.insert(
            "outcome".to_string(),
            Value::String(outcome.status.as_str().to_string()),
        );
        if let Some(label) = outcome.preferred_label.clone() {
            context.insert("preferred_label".to_string(), Value::String(label));
        }

        git.commit_node(&worktree_path, run_id, &node.id, outcome.status.as_str())?;
        last_outcome = outcome.clone();

        let Some(next_edge) = select_next_edge(graph, &node.id, &outcome, &context) else {
            break;
        };
        if next_edge.attrs.get_bool("loop_restart") == Some(true) {
            // Open Question (§9): loop_restart inside a parallel
            // sub-subgraph is disallowed; the safer default is a
            // structural failure abort rather than silently restarting a
            // branch context nobody else can observe.
            return Ok(BranchRunOutcome {
                branch_key,
                start_node_id,
                status: NodeStatus::Fail,
                notes: Some(format!(
                    "loop_restart is not permitted inside a parallel branch (edge {} -> {})",
                    node.id, next_edge.to
                )),
                branch_name: branch.branch_name,
                worktree_path,
            });
        }
        current = next_edge.to.clone();
    }

    let final_sha = git.head_sha(&worktree_path).ok();
    let mut notes = last_outcome.notes.clone();
    if let Some(sha) = final_sha {
        notes = Some(match notes {
            Some(existing) => format!("{existing} (branch head {sha})"),
            None => format!("branch head {sha}"),
        });
    }

    Ok(BranchRunOutcome {
        branch_key,
        start_node_id,
        status: last_outcome.status,
        notes,
        branch_name: branch.branch_name,
        worktree_path,
    })
}

/// Locates the node a branch must converge on: an explicit `join` attribute
/// on the fan-out node wins; otherwise the nearest downstream node whose
/// shape/type resolves to the `parallel.fan_in` handler (a `tripleoctagon`)
/// reachable by forward BFS from the branch's start node.
fn find_branch_join_target(graph: &Graph, start_node_id: &str, fan_node: &Node) -> Option<String> {
    if let Some(explicit) = fan_node.attrs.get_str("join") {
        let explicit = explicit.trim();
        if !explicit.is_empty() && graph.nodes.contains_key(explicit) {
            return Some(explicit.to_string());
        }
    }

    let mut queue = std::collections::VecDeque::new();
    let mut seen = std::collections::HashSet::new();
    queue.push_back(start_node_id.to_string());
    seen.insert(start_node_id.to_string());

    while let Some(current) = queue.pop_front() {
        if let Some(node) = graph.nodes.get(&current) {
            if is_fan_in_node(node) {
                return Some(current);
            }
        }
        for edge in graph.outgoing_edges(&current) {
            if seen.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }
    None
}

fn is_fan_in_node(node: &Node) -> bool {
    node.attrs.get_str("type") == Some("parallel.fan_in")
        || node.attrs.get_str("shape") == Some("tripleoctagon")
}

/// Serializes the dispatcher's per-branch results into the
/// `<node_id>/parallel_results.json` artifact shape described in §4.3.
pub fn parallel_results_artifact(outcome: &ParallelDispatchOutcome) -> Value {
    let entries: Vec<Value> = outcome
        .branches
        .iter()
        .map(|branch| {
            let mut value = branch_result_to_value(&BranchResult {
                branch_id: branch.branch_key.clone(),
                target_node: branch.start_node_id.clone(),
                status: branch.status,
                score: 0.0,
                notes: None,
            });
            if let Value::Object(ref mut map) = value {
                map.insert(
                    "branch_name".to_string(),
                    Value::String(branch.branch_name.clone()),
                );
                map.insert(
                    "worktree_dir".to_string(),
                    Value::String(branch.worktree_path.to_string_lossy().to_string()),
                );
            }
            value
        })
        .collect();
    json!({ "branches": entries })
}
