use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::item::ApItemId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Detection channels. Deliberately an open set: unknown channel names decode
/// to `Other` instead of failing intake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    GmailThread,
    GmailMessage,
    PaymentPortal,
    Procurement,
    Dms,
    Other(String),
}

impl SourceType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::GmailThread => "gmail_thread",
            Self::GmailMessage => "gmail_message",
            Self::PaymentPortal => "payment_portal",
            Self::Procurement => "procurement",
            Self::Dms => "dms",
            Self::Other(name) => name.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "gmail_thread" => Self::GmailThread,
            "gmail_message" => Self::GmailMessage,
            "payment_portal" => Self::PaymentPortal,
            "procurement" => Self::Procurement,
            "dms" => Self::Dms,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One detection event linked to exactly one AP item. Uniqueness is on
/// `(ap_item_id, source_type, source_ref)`; re-linking the same pair is a
/// no-op at the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub ap_item_id: ApItemId,
    pub source_type: SourceType,
    pub source_ref: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Source descriptor as supplied by a detection, before an item exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_type: SourceType,
    pub source_ref: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
}

impl SourceDescriptor {
    pub fn into_source(self, ap_item_id: ApItemId, detected_at: DateTime<Utc>) -> Source {
        Source {
            id: SourceId::generate(),
            ap_item_id,
            source_type: self.source_type,
            source_ref: self.source_ref,
            subject: self.subject,
            sender: self.sender,
            detected_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SourceType;

    #[test]
    fn source_type_parses_known_and_unknown_channels() {
        assert_eq!(SourceType::parse("gmail_thread"), SourceType::GmailThread);
        assert_eq!(SourceType::parse("DMS"), SourceType::Dms);
        assert_eq!(SourceType::parse("fax_gateway"), SourceType::Other("fax_gateway".to_string()));
        assert_eq!(SourceType::parse("fax_gateway").as_str(), "fax_gateway");
    }
}
