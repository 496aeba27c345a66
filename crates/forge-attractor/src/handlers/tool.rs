use crate::{
    AttractorError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext, classify,
    handlers::NodeHandler,
};
use async_trait::async_trait;
use forge_agent::{ExecutionEnvironment, LocalExecutionEnvironment};
use serde_json::Value;

const DEFAULT_TIMEOUT_MS: u64 = 600_000;

/// Runs `tool_command` as a subprocess of its own process group (via
/// `forge_agent::LocalExecutionEnvironment`, which SIGTERMs then
/// SIGKILLs the group after a grace period on timeout/cancellation).
#[derive(Debug, Default)]
pub struct ToolHandler;

#[async_trait]
impl NodeHandler for ToolHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let command = node
            .attrs
            .get_str("tool_command")
            .unwrap_or_default()
            .trim()
            .to_string();
        if command.is_empty() {
            return Ok(NodeOutcome::failure("No tool_command specified"));
        }

        let working_dir = node
            .attrs
            .get_str("tool_cwd")
            .map(ToOwned::to_owned)
            .or_else(|| {
                context
                    .get("internal.git.worktree_path")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
            })
            .unwrap_or_else(|| ".".to_string());

        let timeout_ms = node
            .attrs
            .get_str("tool_timeout_ms")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let env = LocalExecutionEnvironment::new(working_dir);
        let result = env
            .exec_command(&command, timeout_ms, None, None)
            .await
            .map_err(|error| {
                AttractorError::Runtime(format!(
                    "tool node '{}' failed to execute '{}': {}",
                    node.id, command, error
                ))
            })?;

        let mut updates = RuntimeContext::new();
        updates.insert("tool.stdout".to_string(), Value::String(result.stdout.clone()));
        updates.insert("tool.stderr".to_string(), Value::String(result.stderr.clone()));
        updates.insert(
            "tool.exit_code".to_string(),
            Value::Number(result.exit_code.into()),
        );
        updates.insert(
            "tool.output".to_string(),
            Value::String(if result.stdout.is_empty() {
                result.stderr.clone()
            } else {
                result.stdout.clone()
            }),
        );

        if result.timed_out {
            return Ok(NodeOutcome {
                status: NodeStatus::Fail,
                notes: Some(format!(
                    "tool command '{command}' timed out after {timeout_ms}ms"
                )),
                context_updates: updates,
                preferred_label: None,
                suggested_next_ids: Vec::new(),
            });
        }

        if result.exit_code != 0 {
            let classification =
                classify::classify_provider_failure(&node.id, &result.stderr, None);
            return Ok(NodeOutcome {
                status: NodeStatus::Fail,
                notes: Some(format!(
                    "tool command '{}' exited {}: {}",
                    command, result.exit_code, classification.reason
                )),
                context_updates: updates,
                preferred_label: None,
                suggested_next_ids: Vec::new(),
            });
        }

        Ok(NodeOutcome {
            status: NodeStatus::Success,
            notes: Some(format!("tool completed: {command}")),
            context_updates: updates,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dot;

    #[tokio::test(flavor = "multi_thread")]
    async fn tool_handler_missing_command_expected_fail() {
        let graph = parse_dot("digraph G { t [shape=parallelogram] }").expect("graph should parse");
        let node = graph.nodes.get("t").expect("tool node should exist");
        let outcome = ToolHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tool_handler_exit_zero_expected_success() {
        let graph = parse_dot(
            r#"
            digraph G {
                t [shape=parallelogram, tool_command="exit 0"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("t").expect("tool node should exist");
        let outcome = ToolHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tool_handler_retry_then_succeed_script() {
        let temp = tempfile::TempDir::new().expect("temp dir should be created");
        let marker = temp.path().join(".attempt");
        let command = format!(
            "test -f {0} && echo ok || (touch {0}; exit 1)",
            marker.display()
        );
        let graph = parse_dot(&format!(
            r#"
            digraph G {{
                t [shape=parallelogram, tool_command="{command}"]
            }}
            "#
        ))
        .expect("graph should parse");
        let node = graph.nodes.get("t").expect("tool node should exist");

        let first = ToolHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(first.status, NodeStatus::Fail);

        let second = ToolHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(second.status, NodeStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tool_handler_exit_nonzero_expected_fail_with_classification() {
        let graph = parse_dot(
            r#"
            digraph G {
                t [shape=parallelogram, tool_command="echo 'unknown option --foo' 1>&2; exit 1"]
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("t").expect("tool node should exist");
        let outcome = ToolHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Fail);
        assert!(outcome.notes.unwrap_or_default().contains("contract violation"));
    }
}
