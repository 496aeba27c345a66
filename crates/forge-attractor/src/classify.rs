//! Classifies a failing node outcome into a scheduling-relevant class and a
//! stable signature. The signature is the circuit-breaker key consumed by
//! the retry/restart state machine in `runner.rs`.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureClass {
    /// Same input will fail the same way again; never worth retrying past
    /// `max_retries`, and loop-restart must not be attempted.
    Deterministic,
    /// Network error, timeout, rate limit; eligible for retry and restart.
    TransientInfra,
    /// The run's cancellation context fired. Excluded from every counter.
    Canceled,
    /// A handler-level contract violation (e.g. a branch wrote outside its
    /// declared scope). Aborts a parallel branch immediately; in the main
    /// loop it still counts toward the signature breaker.
    Structural,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::TransientInfra => "transient_infra",
            Self::Canceled => "canceled",
            Self::Structural => "structural",
        }
    }

    /// Canceled failures are excluded from both the deterministic-cycle
    /// counter and the loop-restart signature limit.
    pub fn counts_toward_breakers(self) -> bool {
        !matches!(self, Self::Canceled)
    }

    pub fn is_retriable(self) -> bool {
        matches!(self, Self::TransientInfra)
    }
}

impl FailureClassification {
    /// True only for signatures matched against a *known* deterministic
    /// pattern (a recognized provider contract violation or a missing
    /// executable) — never for the catch-all `provider_failure|*|unknown`
    /// fallback. The fallback means "we don't actually know why this
    /// failed", so per-node retries still get a chance to recover (a
    /// flaky shell command classifies this way); only a confidently
    /// identified contract violation fails fast immediately.
    pub fn is_confidently_deterministic(&self) -> bool {
        self.class == FailureClass::Deterministic
            && (self.signature.starts_with("provider_contract|")
                || self.signature == "provider_executable_missing")
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureClassification {
    pub class: FailureClass,
    /// Stable short string identifying the *kind* of failure, e.g.
    /// `provider_timeout|openai|timeout`. Used as the cycle-breaker key.
    pub signature: String,
    pub reason: String,
}

const DETERMINISTIC_PATTERNS: &[(&str, &str)] = &[
    ("unknown option", "unknown_option"),
    ("unknown flag", "unknown_option"),
    ("stream_json_requires_verbose", "stream_json_requires_verbose"),
    ("schema violation", "schema_violation"),
    ("invalid argument", "invalid_argument"),
    ("bad argument", "invalid_argument"),
    ("unsupported model", "model_not_found"),
    ("model not found", "model_not_found"),
];

const TRANSIENT_PATTERNS: &[(&str, &str)] = &[
    ("idle timeout", "idle_timeout"),
    ("timed out", "timeout"),
    ("timeout", "timeout"),
    ("rate limit", "rate_limit"),
    ("too many requests", "rate_limit"),
    ("connection refused", "connection_refused"),
    ("connection reset", "connection_reset"),
    ("broken pipe", "broken_pipe"),
    ("service unavailable", "service_unavailable"),
    ("gateway timeout", "gateway_timeout"),
];

/// Classifies a handler failure from its provider key plus the observed
/// stderr text and/or a run-level error string (e.g. from spawning a
/// subprocess). `provider` may be a node id for non-provider handlers.
pub fn classify_provider_failure(
    provider: &str,
    stderr_text: &str,
    run_err: Option<&str>,
) -> FailureClassification {
    let haystack = format!(
        "{} {}",
        stderr_text.to_ascii_lowercase(),
        run_err.unwrap_or_default().to_ascii_lowercase()
    );

    if is_exec_not_found(run_err) {
        return FailureClassification {
            class: FailureClass::Deterministic,
            signature: "provider_executable_missing".to_string(),
            reason: format!("executable for provider '{provider}' was not found"),
        };
    }

    for (pattern, suffix) in DETERMINISTIC_PATTERNS {
        if haystack.contains(pattern) {
            return FailureClassification {
                class: FailureClass::Deterministic,
                signature: format!("provider_contract|{provider}|{suffix}"),
                reason: format!("provider '{provider}' reported a contract violation: {pattern}"),
            };
        }
    }

    if haystack.contains("not found") {
        return FailureClassification {
            class: FailureClass::Deterministic,
            signature: format!("provider_contract|{provider}|model_not_found"),
            reason: format!("provider '{provider}' could not resolve the requested model"),
        };
    }

    for (pattern, suffix) in TRANSIENT_PATTERNS {
        if haystack.contains(pattern) {
            return FailureClassification {
                class: FailureClass::TransientInfra,
                signature: format!("provider_timeout|{provider}|{suffix}"),
                reason: format!("provider '{provider}' reported a transient failure: {pattern}"),
            };
        }
    }

    FailureClassification {
        class: FailureClass::Deterministic,
        signature: format!("provider_failure|{provider}|unknown"),
        reason: format!("provider '{provider}' failed for an unrecognized reason"),
    }
}

fn is_exec_not_found(run_err: Option<&str>) -> bool {
    let Some(err) = run_err else { return false };
    let lower = err.to_ascii_lowercase();
    lower.contains("no such file or directory") || lower.contains("program not found")
}

/// The outer context was cancelled mid-stage. Never counted toward any
/// breaker.
pub fn classify_cancellation() -> FailureClassification {
    FailureClassification {
        class: FailureClass::Canceled,
        signature: "canceled".to_string(),
        reason: "run was canceled".to_string(),
    }
}

/// A handler detected it violated its own contract (e.g. wrote outside its
/// declared scope). `node_id` anchors the signature so distinct nodes don't
/// collide in the breaker map.
pub fn classify_structural(node_id: &str, reason: impl Into<String>) -> FailureClassification {
    let reason = reason.into();
    FailureClassification {
        class: FailureClass::Structural,
        signature: format!("structural|{node_id}"),
        reason,
    }
}
