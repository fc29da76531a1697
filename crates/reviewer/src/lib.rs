pub mod review;
pub mod rules;
pub mod stats;

pub use review::{ReviewAction, Reviewer, ReviewerError, ReviewerKind, RiskLevel, Review, rewrite_template};
pub use rules::{Severity, ViolationTag, run_rule_tier};
pub use stats::{DefenseStatistics, ReviewerStats};
