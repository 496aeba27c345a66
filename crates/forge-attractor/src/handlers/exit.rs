use crate::{
    AttractorError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext, handlers::NodeHandler,
};
use async_trait::async_trait;

/// Terminal nodes are intercepted by the scheduler before dispatch in the
/// ordinary traversal path; this handler only runs when a terminal-shaped
/// node is invoked directly (e.g. through a fixture registry in tests).
#[derive(Debug, Default)]
pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        Ok(NodeOutcome {
            status: NodeStatus::Success,
            notes: Some(format!("terminal node '{}' reached", node.id)),
            context_updates: RuntimeContext::new(),
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dot;

    #[tokio::test(flavor = "current_thread")]
    async fn exit_handler_execute_expected_success() {
        let graph = parse_dot("digraph G { exit [shape=Msquare] }").expect("graph should parse");
        let node = graph.nodes.get("exit").expect("exit node should exist");
        let outcome = ExitHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
    }
}
