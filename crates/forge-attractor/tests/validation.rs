use forge_attractor::{Severity, parse_dot, validate, validate_or_raise};

#[test]
fn validate_reachability_orphan_expected_error() {
    let graph = parse_dot(
        r#"
        digraph G {
            start [shape=Mdiamond]
            exit [shape=Msquare]
            orphan
            start -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let diagnostics = validate(&graph, &[]);
    assert!(
        diagnostics
            .iter()
            .any(|d| d.rule == "reachability" && d.severity == Severity::Error)
    );
}

#[test]
fn validate_or_raise_valid_graph_expected_ok() {
    let graph = parse_dot(
        r#"
        digraph G {
            start [shape=Mdiamond]
            plan [prompt="Plan"]
            exit [shape=Msquare]
            start -> plan -> exit
        }
        "#,
    )
    .expect("graph should parse");

    validate_or_raise(&graph, &[]).expect("graph should be valid");
}

#[test]
fn validate_or_raise_circle_doublecircle_aliases_expected_ok() {
    // §3's closed shape set: `circle`/`doublecircle` are start/terminal
    // aliases, so a graph using only these (no `Mdiamond`/`Msquare`, no
    // `start`/`exit` ids) must still validate as having exactly one start
    // and at least one terminal, reachable from start.
    let graph = parse_dot(
        r#"
        digraph G {
            begin [shape=circle]
            plan [prompt="Plan"]
            done [shape=doublecircle]
            begin -> plan -> done
        }
        "#,
    )
    .expect("graph should parse");

    validate_or_raise(&graph, &[]).expect("graph should be valid");
    assert_eq!(graph.start_candidates().len(), 1);
    assert_eq!(graph.start_candidates()[0].id, "begin");
    assert!(
        graph
            .terminal_candidates()
            .iter()
            .any(|node| node.id == "done")
    );
}
