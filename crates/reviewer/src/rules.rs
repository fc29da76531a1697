use drift_memory::{Issue, IssueType, Response};
use serde::{Deserialize, Serialize};

/// A single rule- or model-tier finding. Tags are not mutually exclusive —
/// a response can trip several at once (see `ViolationTag::severity`'s
/// doc comment for the aggregation policy this implies).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationTag {
    UnauthorizedRefund,
    OverPromise,
    Perfunctory,
    Inappropriate,
    AvoidingResponsibility,
    /// Model-tier-only verdict: the judge model found the response
    /// misleading without any rule-tier pattern having fired.
    Mislead,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ViolationTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationTag::UnauthorizedRefund => "unauthorized_refund",
            ViolationTag::OverPromise => "over_promise",
            ViolationTag::Perfunctory => "perfunctory",
            ViolationTag::Inappropriate => "inappropriate",
            ViolationTag::AvoidingResponsibility => "avoiding_responsibility",
            ViolationTag::Mislead => "mislead",
        }
    }

    /// Base severity the rule/model tier assigns this tag when it fires.
    pub fn severity(self) -> Severity {
        match self {
            ViolationTag::UnauthorizedRefund => Severity::High,
            ViolationTag::OverPromise => Severity::High,
            ViolationTag::Inappropriate => Severity::High,
            ViolationTag::Perfunctory => Severity::Medium,
            ViolationTag::AvoidingResponsibility => Severity::Medium,
            ViolationTag::Mislead => Severity::Low,
        }
    }

    /// Magnitude used by the risk-score formula (`min(1, max_penalty/200)`).
    pub fn penalty(self) -> f32 {
        match self {
            ViolationTag::UnauthorizedRefund => 150.0,
            ViolationTag::OverPromise => 120.0,
            ViolationTag::Inappropriate => 130.0,
            ViolationTag::AvoidingResponsibility => 50.0,
            ViolationTag::Perfunctory => 40.0,
            ViolationTag::Mislead => 80.0,
        }
    }

    /// Whether a REWRITE can plausibly repair a response tagged this way —
    /// the template substitution is keyword-driven and only makes sense for
    /// findings about what the response failed to *say*, not about what it
    /// promised it shouldn't have.
    pub fn auto_correctable(self) -> bool {
        matches!(self, ViolationTag::Perfunctory | ViolationTag::AvoidingResponsibility)
    }
}

const OVER_PROMISE_PHRASES: [&str; 5] = ["100%", "guarantee", "absolutely", "certainly", "promise you"];
const UNCONDITIONAL_REFUND_PHRASES: [&str; 3] =
    ["refund has been processed", "refund is on its way", "immediate refund"];
const REFUND_OFFER_PHRASES: [&str; 3] = ["full refund", "refund you", "issue a refund"];
const DISMISSIVE_PHRASES: [&str; 4] = ["don't know", "not my problem", "not my job", "figure it out"];
const DEFLECTION_PHRASES: [&str; 4] =
    ["not my department", "contact someone else", "nothing i can do", "take it up with"];
const PERFUNCTORY_MIN_LEN: usize = 15;
const FILLER_WORDS: [&str; 4] = ["ok", "sure", "noted", "done"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Runs the pattern-based rule tier against one response, returning every
/// tag that fires. Order is the order listed in the component design —
/// callers rely on it only for readability, not for precedence (all
/// firing rules are reported; aggregation decides what that means).
pub fn run_rule_tier(issue: &Issue, response: &Response) -> Vec<ViolationTag> {
    let text = response.content.to_lowercase();
    let mut tags = Vec::new();

    let unconditional_refund = contains_any(&text, &UNCONDITIONAL_REFUND_PHRASES);
    let refund_offer = contains_any(&text, &REFUND_OFFER_PHRASES);
    let is_refund_issue = issue.issue_type == IssueType::RefundRequest;
    if (refund_offer && !is_refund_issue) || unconditional_refund {
        tags.push(ViolationTag::UnauthorizedRefund);
    }

    if contains_any(&text, &OVER_PROMISE_PHRASES) {
        tags.push(ViolationTag::OverPromise);
    }

    if contains_any(&text, &DISMISSIVE_PHRASES) {
        tags.push(ViolationTag::Inappropriate);
    }

    if contains_any(&text, &DEFLECTION_PHRASES) {
        tags.push(ViolationTag::AvoidingResponsibility);
    }

    let trimmed = response.content.trim();
    let word_count = trimmed.split_whitespace().count();
    let filler_count = trimmed
        .split_whitespace()
        .filter(|w| FILLER_WORDS.contains(&w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase().as_str()))
        .count();
    let filler_density = if word_count == 0 { 0.0 } else { filler_count as f32 / word_count as f32 };
    if trimmed.len() < PERFUNCTORY_MIN_LEN || filler_density > 0.5 {
        tags.push(ViolationTag::Perfunctory);
    }

    tags
}
