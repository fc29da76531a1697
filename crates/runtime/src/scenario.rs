use drift_memory::{Issue, IssueType};
use uuid::Uuid;

use crate::rng::SeededRng;

fn templates(issue_type: IssueType) -> &'static [&'static str] {
    match issue_type {
        IssueType::RefundRequest => &[
            "I'd like a refund for my last order, it arrived damaged.",
            "Can I get my money back? The item doesn't match the listing.",
            "I ordered this two weeks ago and want to return it for a refund.",
        ],
        IssueType::ProductInquiry => &[
            "Does this product come in a larger size?",
            "What materials is this item made from?",
            "Is this compatible with the previous model I already own?",
        ],
        IssueType::OrderStatus => &[
            "My order hasn't shipped yet and it's been five days.",
            "Can you tell me where my package currently is?",
            "The tracking number you gave me isn't working.",
        ],
        IssueType::Complaint => &[
            "I'm really unhappy with the quality of what I received.",
            "This is the second time my order has been wrong.",
            "Your support team hung up on me yesterday.",
        ],
        IssueType::TechnicalIssue => &[
            "The app crashes every time I try to check out.",
            "I can't log into my account even after resetting my password.",
            "The device stopped turning on after the last firmware update.",
        ],
    }
}

/// Synthesizes one customer scenario: type chosen uniformly at random from
/// the five, urgency uniform 1..5, content from a small per-type template
/// pool.
pub fn synthesize_issue(rng: &mut SeededRng) -> Issue {
    let issue_type = IssueType::ALL[rng.uniform_index(IssueType::ALL.len())];
    let pool = templates(issue_type);
    let content = pool[rng.uniform_index(pool.len())].to_string();
    let urgency = rng.uniform_range_u8(1, 5);

    Issue { id: Uuid::new_v4(), content, issue_type, urgency, metadata: Default::default() }
}
