//! Document: raw input text plus source metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How much the source is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Low,
    #[default]
    Standard,
    High,
}

/// Where a document came from and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Free-form origin (URL, file path, feed name).
    pub origin: String,
    /// When the source was published or captured. Used as the default
    /// `valid_from` of statements extracted without an explicit date.
    pub timestamp: DateTime<Utc>,
    pub trust: TrustLevel,
}

/// A raw input document. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub text: String,
    pub metadata: SourceMetadata,
}

impl Document {
    pub fn new(text: impl Into<String>, metadata: SourceMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_document_serde_roundtrip() {
        let doc = Document::new(
            "Acme Corp acquired Beta Inc in 2020.",
            SourceMetadata {
                origin: "news/acme.txt".to_string(),
                timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                trust: TrustLevel::High,
            },
        );
        let json = serde_json::to_string(&doc).expect("serialize");
        let back: Document = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, doc);
    }

    #[test]
    fn test_trust_level_wire_format() {
        assert_eq!(serde_json::to_string(&TrustLevel::Low).unwrap(), "\"low\"");
        assert_eq!(TrustLevel::default(), TrustLevel::Standard);
    }
}
