//! Chunk → atomic, time-bounded statements.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm_client::Message;
use crate::model::Chunk;

use super::format_time;

const SYSTEM: &str = "You extract atomic factual statements from text. \
Each statement asserts exactly one fact about exactly one subject and must be \
understandable without the surrounding text. Resolve pronouns to the names they \
refer to. Do not invent facts.";

const INSTRUCTIONS: &str = "Extract statements from the chunk below.

For each statement give:
- subject: the entity the fact is about, named as in the text
- text: the statement as one self-contained sentence
- valid_from: when the fact started to hold (RFC 3339, YYYY-MM-DD, YYYY-MM or YYYY), or null if the text gives no date
- valid_to: when the fact stopped holding, or null if it still holds or the text does not say

Dates relative to the reference time (\"last year\") must be converted to absolute dates.";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedStatements {
    pub statements: Vec<ExtractedStatement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedStatement {
    pub subject: String,
    pub text: String,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
}

pub fn messages(chunk: &Chunk) -> Vec<Message> {
    let user = format!(
        "{INSTRUCTIONS}\n\n<REFERENCE_TIME>{}</REFERENCE_TIME>\n<CHUNK>\n{}\n</CHUNK>",
        format_time(chunk.reference_time),
        chunk.text.trim()
    );
    vec![Message::system(SYSTEM), Message::user(user)]
}
