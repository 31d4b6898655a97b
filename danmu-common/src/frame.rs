use serde::{Deserialize, Serialize};

use crate::Comment;

/// Overlay display parameters pushed to viewers in a `style` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylePayload {
    pub container_width: u32,
    pub font_size: u32,
    pub text_color: String,
    pub lines: usize,
}

/// Server → viewer frames. Viewers send nothing back beyond pongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ViewerFrame {
    /// Display configuration, sent on connect and after every reload
    Style(StylePayload),

    /// Wipe the displayed items; always precedes a danmu batch
    Clear {},

    /// One comment to display
    Danmu { username: String, message: String },
}

impl ViewerFrame {
    pub fn style(payload: StylePayload) -> Self {
        Self::Style(payload)
    }

    pub fn clear() -> Self {
        Self::Clear {}
    }

    pub fn danmu(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Danmu {
            username: username.into(),
            message: message.into(),
        }
    }

    /// `clear` followed by one `danmu` per comment, keeping snapshot order.
    pub fn snapshot(comments: &[Comment]) -> Vec<Self> {
        std::iter::once(Self::clear())
            .chain(
                comments
                    .iter()
                    .map(|c| Self::danmu(c.author.as_str(), c.text.as_str())),
            )
            .collect()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Style(_) => "style",
            Self::Clear {} => "clear",
            Self::Danmu { .. } => "danmu",
        }
    }
}
