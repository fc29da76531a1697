use chrono::{DateTime, Utc};
use drift_strategy::Strategy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    RefundRequest,
    ProductInquiry,
    OrderStatus,
    Complaint,
    TechnicalIssue,
}

impl IssueType {
    pub const ALL: [IssueType; 5] = [
        IssueType::RefundRequest,
        IssueType::ProductInquiry,
        IssueType::OrderStatus,
        IssueType::Complaint,
        IssueType::TechnicalIssue,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub content: String,
    pub issue_type: IssueType,
    pub urgency: u8,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub content: String,
    pub strategy: Strategy,
    pub ticket_closed: bool,
    pub response_time_seconds: f32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One complete episode: issue, response, optional outcome (absent when the
/// decision was blocked before an outcome could be simulated), the reward
/// breakdown, and the violation tags (if any) the reviewer assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub episode: u32,
    pub issue: Issue,
    pub response: Response,
    pub outcome: Option<drift_reward::Outcome>,
    pub reward: drift_reward::RewardBreakdown,
    pub strategy: Strategy,
    pub is_violation: bool,
    #[serde(default)]
    pub violation_tags: Vec<String>,
}

impl Experience {
    /// Deterministic key used for exact-match dedup on admission: the issue
    /// type plus the response content, which is what actually repeats across
    /// episodes when the agent settles into a strategy.
    pub fn canonical_summary(&self) -> String {
        format!("{:?}|{}", self.issue.issue_type, self.response.content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub experience: Experience,
    pub embedding: Vec<f32>,
    pub importance: f32,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}
