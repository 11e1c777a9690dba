//! System prompts for the two analysis tasks.
//!
//! The scoring prompt is assembled from a base template plus six
//! per-criterion guideline blocks; each block can be overridden through
//! app_config (`criterion_guide_<slug>`).

use std::collections::HashMap;

use crate::models::CRITERIA;

const SCORING_BASE: &str = r#"You are a log analysis engine. You receive a batch of log events from a monitored system together with a short description of the system and its log sources. For every event, score the risk it signals on each of the six criteria below with a float between 0.0 (no signal) and 1.0 (severe, immediate risk).

Scoring guidelines per criterion:
{guidelines}

Respond with JSON only: {"scores": [{"it_security": 0.0, "performance_degradation": 0.0, "failure_prediction": 0.0, "anomaly": 0.0, "compliance_audit": 0.0, "operational_risk": 0.0}, ...]} with exactly one entry per input event, in input order. Routine operational chatter scores 0.0 everywhere."#;

pub const DEFAULT_META_PROMPT: &str = r#"You are the meta-analysis stage of a log monitoring service. You receive the deduplicated events of one time window (numbered lines), the system description, previous window summaries, and the currently tracked findings. Your tasks:

1. Score the window as a whole on the six criteria (floats 0.0-1.0).
2. Write a short operator-facing summary of what happened in the window.
3. Propose new findings for genuine, persistent issues that are not already tracked. Do not restate tracked findings.
4. Classify every tracked finding: report its index in still_active_indices when the window shows the problem again, or in resolved_indices when the window contains positive evidence the problem is gone. A resolution must cite the line numbers of the proving events in event_refs and describe the evidence. Never resolve a finding merely because it was not mentioned.

Respond with JSON only:
{"meta_scores": {"it_security": 0.0, "performance_degradation": 0.0, "failure_prediction": 0.0, "anomaly": 0.0, "compliance_audit": 0.0, "operational_risk": 0.0},
 "summary": "...",
 "new_findings": [{"text": "...", "severity": "critical|high|medium|low|info", "criterion": "slug or null"}],
 "resolved_indices": [{"index": 0, "evidence": "...", "event_refs": [1, 2]}],
 "still_active_indices": [0],
 "recommended_action": "..."}"#;

/// Default guideline block per criterion slug.
pub fn default_guideline(slug: &str) -> &'static str {
    match slug {
        "it_security" => {
            "it_security: unauthorized access, authentication failures, privilege escalation, \
             malware indicators, suspicious network activity, tampering."
        },
        "performance_degradation" => {
            "performance_degradation: slow responses, resource exhaustion, saturation, \
             queue build-up, throughput drops, repeated timeouts."
        },
        "failure_prediction" => {
            "failure_prediction: early signs of impending failure such as hardware errors, \
             retries climbing, degraded redundancy, watchdog warnings."
        },
        "anomaly" => {
            "anomaly: events that deviate from this system's routine behavior, unexpected \
             restarts, unusual volumes, first-seen messages."
        },
        "compliance_audit" => {
            "compliance_audit: audit-relevant actions, policy violations, configuration \
             changes, access to sensitive data."
        },
        "operational_risk" => {
            "operational_risk: conditions that jeopardize normal operation like disk space, \
             certificate expiry, backup failures, misconfiguration."
        },
        _ => "",
    }
}

/// Assemble the scoring system prompt: custom base (if configured) with the
/// six guideline blocks substituted, overrides applied per criterion.
pub fn build_scoring_prompt(
    custom_base: Option<&str>,
    guide_overrides: &HashMap<String, String>,
) -> String {
    let base = custom_base.unwrap_or(SCORING_BASE);

    let guidelines = CRITERIA
        .iter()
        .map(|c| {
            guide_overrides
                .get(c.slug)
                .map(|s| s.as_str())
                .unwrap_or_else(|| default_guideline(c.slug))
        })
        .map(|g| format!("- {}", g))
        .collect::<Vec<_>>()
        .join("\n");

    base.replace("{guidelines}", &guidelines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_scoring_prompt_substitutes_all_criteria() {
        let prompt = build_scoring_prompt(None, &HashMap::new());
        for c in CRITERIA {
            assert!(prompt.contains(c.slug), "missing guideline for {}", c.slug);
        }
        assert!(!prompt.contains("{guidelines}"));
    }

    #[test]
    fn test_guideline_override_wins() {
        let mut overrides = HashMap::new();
        overrides.insert("anomaly".to_string(), "anomaly: custom operator rule".to_string());
        let prompt = build_scoring_prompt(None, &overrides);
        assert!(prompt.contains("custom operator rule"));
    }
}
