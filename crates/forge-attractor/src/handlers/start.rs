use crate::{
    AttractorError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext, handlers::NodeHandler,
};
use async_trait::async_trait;

/// The start node has no side effects; it exists only to anchor traversal.
/// The scheduler always begins at this node and advances past it on its
/// first iteration.
#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        Ok(NodeOutcome {
            status: NodeStatus::Success,
            notes: Some(format!("start node '{}' entered", node.id)),
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
    async fn start_handler_execute_expected_success() {
        let graph = parse_dot("digraph G { start [shape=Mdiamond] }").expect("graph should parse");
        let node = graph.nodes.get("start").expect("start node should exist");
        let outcome = StartHandler
            .execute(node, &RuntimeContext::new(), &graph)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, NodeStatus::Success);
    }
}
