//! Statement → entity mentions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm_client::Message;
use crate::model::{EntityType, Statement};

const SYSTEM: &str = "You identify the entities mentioned in a factual statement \
and classify each one.";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedEntities {
    pub entities: Vec<ExtractedEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedEntity {
    pub name: String,
    /// One of the allowed entity types.
    pub entity_type: String,
    /// Whether this entity is the subject of the statement.
    pub is_subject: bool,
}

pub fn messages(statement: &Statement) -> Vec<Message> {
    let types = EntityType::ALL
        .iter()
        .map(EntityType::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let user = format!(
        "List the entities mentioned in the statement below.\n\
         Allowed entity types: {types}.\n\
         Mark exactly one entity, the subject, with is_subject = true.\n\n\
         <SUBJECT>{}</SUBJECT>\n<STATEMENT>{}</STATEMENT>",
        statement.subject, statement.text
    );
    vec![Message::system(SYSTEM), Message::user(user)]
}
