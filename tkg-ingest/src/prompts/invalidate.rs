//! Does a newer statement supersede older ones about the same entity?

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm_client::Message;
use crate::model::Statement;

use super::format_time;

const SYSTEM: &str = "You maintain a timeline of facts about one entity. \
A newer fact supersedes an older one when both cannot be true at the same time, \
so the older fact must have stopped holding when the newer one began. \
Facts that can hold together do not supersede each other.";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InvalidationVerdicts {
    pub verdicts: Vec<InvalidationVerdict>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InvalidationVerdict {
    /// Number of the candidate as listed in the prompt (1-based).
    pub candidate: usize,
    pub supersede: bool,
    /// Between 0 and 1.
    pub confidence: f32,
}

fn describe(s: &Statement) -> String {
    let until = s
        .valid_to
        .map(format_time)
        .unwrap_or_else(|| "open".to_string());
    format!("{} (valid from {} until {until})", s.text, format_time(s.valid_from))
}

/// One set-wise request judging every candidate against `newer`.
pub fn messages(newer: &Statement, candidates: &[Statement]) -> Vec<Message> {
    let listed = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] {}", i + 1, describe(c)))
        .collect::<Vec<_>>()
        .join("\n");
    let user = format!(
        "Decide for each candidate whether the new statement supersedes it.\n\
         Return one verdict per candidate with its number, supersede, and a confidence between 0 and 1.\n\n\
         <NEW_STATEMENT>{}</NEW_STATEMENT>\n<CANDIDATES>\n{listed}\n</CANDIDATES>",
        describe(newer)
    );
    vec![Message::system(SYSTEM), Message::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn candidates_are_numbered_from_one() {
        let at = |y| Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).unwrap();
        let newer = Statement::proposed(Uuid::new_v4(), 0, "Acme", "Acme sold Beta.", at(2023), None);
        let a = Statement::proposed(Uuid::new_v4(), 0, "Acme", "Acme owns Beta.", at(2020), None);
        let b = Statement::proposed(Uuid::new_v4(), 0, "Acme", "Acme is based in Oslo.", at(2019), None);

        let msgs = messages(&newer, &[a, b]);
        let user = &msgs[1].content;
        assert!(user.contains("<NEW_STATEMENT>Acme sold Beta. (valid from 2023-01-01T00:00:00Z until open)"));
        assert!(user.contains("[1] Acme owns Beta."));
        assert!(user.contains("[2] Acme is based in Oslo."));
    }
}
