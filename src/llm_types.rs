use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

/// Request body for the Anthropic Messages API.
#[derive(Serialize, Default)]
pub struct LlmPayload {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<LlmMessage>,
}

#[derive(Deserialize, Debug)]
pub struct LlmResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<LlmContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Option<LlmUsageStats>,
}

impl LlmResponse {
    /// Concatenated text blocks of the reply.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                LlmContentBlock::Text { text } => Some(text.as_str()),
                LlmContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
pub struct LlmUsageStats {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// The JSON object the collections prompt asks the model to reply with. Enum-like fields stay
/// strings here and are normalised afterwards.
#[derive(Deserialize, Debug)]
pub struct LlmAnalysis {
    pub intent: String,
    pub sentiment: String,
    pub slots: serde_json::Map<String, serde_json::Value>,
    pub reply_text: String,
    pub next_state: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}
