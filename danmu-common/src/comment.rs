use serde::{Deserialize, Serialize};

/// A single collected comment. Identity is `id`; the store upserts on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub target_id: String,
    pub author: String,
    pub text: String,
    /// `YYYY-MM-DD HH:MM:SS`, or empty when the upstream value was unparseable.
    pub created_at: String,
}

impl Comment {
    pub fn new(
        id: impl Into<String>,
        target_id: impl Into<String>,
        author: impl Into<String>,
        text: impl Into<String>,
        created_at: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            target_id: target_id.into(),
            author: author.into(),
            text: text.into(),
            created_at: created_at.into(),
        }
    }
}
