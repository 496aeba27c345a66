use crate::{Edge, Graph, NodeOutcome, RuntimeContext, evaluate_condition_expression};

pub fn select_next_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return None;
    }

    // Step 1: every edge whose condition matches. An edge with no condition
    // is implicitly true, so it is eligible alongside edges with an
    // explicit, now-true condition — §4.9 step 2's preferred-label
    // preference must be evaluated over this whole set, not just the
    // subset with an explicit condition.
    let eligible: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            let condition = edge.attrs.get_str("condition").unwrap_or_default().trim();
            condition.is_empty()
                || evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
        })
        .collect();
    if eligible.is_empty() {
        return None;
    }

    // Step 2: preferred label, among all eligible edges
    if let Some(preferred) = outcome.preferred_label.as_ref() {
        let preferred = normalize_label(preferred);
        if let Some(edge) = eligible.iter().find(|edge| {
            normalize_label(edge.attrs.get_str("label").unwrap_or_default()) == preferred
        }) {
            return Some(*edge);
        }
    }

    // Step 3: suggested next ids
    if !outcome.suggested_next_ids.is_empty() {
        for suggested in &outcome.suggested_next_ids {
            if let Some(edge) = eligible.iter().find(|edge| edge.to == *suggested) {
                return Some(*edge);
            }
        }
    }

    // Step 4: first in declaration order among the eligible edges
    best_by_order(eligible.iter().copied())
}

/// Declaration order is the scheduler's tie-break: the edge that appeared
/// first in the source graph wins.
fn best_by_order<'a, I>(edges: I) -> Option<&'a Edge>
where
    I: IntoIterator<Item = &'a Edge>,
{
    edges.into_iter().min_by_key(|edge| edge.order)
}

fn normalize_label(input: &str) -> String {
    let trimmed = input.trim().to_ascii_lowercase();

    if trimmed.starts_with('[') {
        if let Some((_, rest)) = trimmed.split_once(']') {
            return rest.trim().to_string();
        }
    }

    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b')' {
        return trimmed[2..].trim().to_string();
    }

    if bytes.len() >= 3 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b' ' && bytes[2] == b'-'
    {
        return trimmed[3..].trim().to_string();
    }

    trimmed
}
