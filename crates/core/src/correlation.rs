//! Deduplication and correlation: decides whether a new detection is the
//! same logical invoice as an existing open item. Pure decision logic; the
//! caller loads candidates and applies the outcome.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::item::{ApItem, ApItemId};
use crate::domain::source::SourceDescriptor;

#[derive(Clone, Debug, PartialEq)]
pub struct CorrelationConfig {
    /// Absolute amount variance still treated as the same invoice.
    pub amount_tolerance: Decimal,
    /// How far back attachment-hash matching looks for open items.
    pub attachment_lookback_days: i64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self { amount_tolerance: Decimal::new(1, 2), attachment_lookback_days: 30 }
    }
}

/// A normalized detection as delivered by an intake channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub vendor_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub invoice_number: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub confidence: f64,
    pub attachment_hashes: Vec<String>,
    pub source: SourceDescriptor,
}

/// How a detection relates to the existing open items.
#[derive(Clone, Debug, PartialEq)]
pub enum CorrelationDecision {
    /// No open item matches; create a fresh one.
    NewItem,
    /// Same invoice key and amount within tolerance; attach the source to
    /// the existing item.
    Merge { existing: ApItemId, reason: MergeReason },
    /// Same invoice key but a materially different amount. A new item is
    /// created flagged for manual disambiguation, never merged silently.
    Conflict { flagged_against: ApItemId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    InvoiceNumber,
    AttachmentHash,
}

impl MergeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceNumber => "invoice_number",
            Self::AttachmentHash => "attachment_hash",
        }
    }
}

/// Candidate facts the decision needs about one open item.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenItemCandidate {
    pub id: ApItemId,
    pub invoice_key: String,
    pub vendor_name: String,
    pub invoice_number: Option<String>,
    pub amount: Decimal,
    pub attachment_hashes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl OpenItemCandidate {
    pub fn from_item(item: &ApItem, attachment_hashes: Vec<String>) -> Self {
        Self {
            id: item.id.clone(),
            invoice_key: item.invoice_key.clone(),
            vendor_name: item.vendor_name.clone(),
            invoice_number: item.invoice_number.clone(),
            amount: item.amount,
            attachment_hashes,
            created_at: item.created_at,
        }
    }
}

/// Correlation identity: a stable digest over the normalized vendor name,
/// invoice number, amount and due date. Empty when there is no invoice
/// number, because amount and vendor alone are too weak to dedup on.
pub fn invoice_key(
    vendor_name: &str,
    invoice_number: Option<&str>,
    amount: Decimal,
    due_date: Option<NaiveDate>,
) -> String {
    let Some(invoice_number) = invoice_number.map(str::trim).filter(|value| !value.is_empty())
    else {
        return String::new();
    };

    let mut hasher = Sha256::new();
    hasher.update(normalize(vendor_name).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize(invoice_number).as_bytes());
    hasher.update(b"|");
    hasher.update(amount.normalize().to_string().as_bytes());
    hasher.update(b"|");
    if let Some(due_date) = due_date {
        hasher.update(due_date.to_string().as_bytes());
    }

    hex_digest(&hasher.finalize())
}

/// Classify a detection against the organization's open items.
///
/// Priority order: invoice-number identity first, attachment-hash fallback
/// second, otherwise a new item. `candidates` must already be restricted to
/// open items of the same organization.
pub fn correlate(
    detection: &Detection,
    candidates: &[OpenItemCandidate],
    config: &CorrelationConfig,
    now: DateTime<Utc>,
) -> CorrelationDecision {
    if let Some(invoice_number) = detection
        .invoice_number
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        let same_invoice = candidates.iter().find(|candidate| {
            normalize(&candidate.vendor_name) == normalize(&detection.vendor_name)
                && candidate
                    .invoice_number
                    .as_deref()
                    .is_some_and(|existing| normalize(existing) == normalize(invoice_number))
        });

        if let Some(existing) = same_invoice {
            let variance = (existing.amount - detection.amount).abs();
            if variance <= config.amount_tolerance {
                return CorrelationDecision::Merge {
                    existing: existing.id.clone(),
                    reason: MergeReason::InvoiceNumber,
                };
            }
            return CorrelationDecision::Conflict { flagged_against: existing.id.clone() };
        }
        return CorrelationDecision::NewItem;
    }

    if !detection.attachment_hashes.is_empty() {
        let cutoff = now - Duration::days(config.attachment_lookback_days);
        let hash_match = candidates.iter().find(|candidate| {
            candidate.created_at >= cutoff
                && normalize(&candidate.vendor_name) == normalize(&detection.vendor_name)
                && candidate
                    .attachment_hashes
                    .iter()
                    .any(|hash| detection.attachment_hashes.contains(hash))
        });

        if let Some(existing) = hash_match {
            return CorrelationDecision::Merge {
                existing: existing.id.clone(),
                reason: MergeReason::AttachmentHash,
            };
        }
    }

    CorrelationDecision::NewItem
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use crate::domain::item::ApItemId;
    use crate::domain::source::{SourceDescriptor, SourceType};

    use super::{
        correlate, invoice_key, CorrelationConfig, CorrelationDecision, Detection, MergeReason,
        OpenItemCandidate,
    };

    fn detection(invoice_number: Option<&str>, amount: Decimal) -> Detection {
        Detection {
            vendor_name: "Initech Supplies".to_string(),
            amount,
            currency: "USD".to_string(),
            invoice_number: invoice_number.map(str::to_string),
            due_date: None,
            confidence: 0.9,
            attachment_hashes: Vec::new(),
            source: SourceDescriptor {
                source_type: SourceType::GmailThread,
                source_ref: "thread-1".to_string(),
                subject: Some("Invoice INV-1".to_string()),
                sender: Some("billing@initech.test".to_string()),
            },
        }
    }

    fn candidate(id: &str, invoice_number: Option<&str>, amount: Decimal) -> OpenItemCandidate {
        OpenItemCandidate {
            id: ApItemId(id.to_string()),
            invoice_key: invoice_key("Initech Supplies", invoice_number, amount, None),
            vendor_name: "Initech Supplies".to_string(),
            invoice_number: invoice_number.map(str::to_string),
            amount,
            attachment_hashes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn invoice_key_is_stable_under_case_and_whitespace() {
        let a = invoice_key("Initech Supplies", Some("INV-1"), Decimal::new(100_00, 2), None);
        let b = invoice_key("  initech supplies ", Some(" inv-1 "), Decimal::new(100_00, 2), None);

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn invoice_key_is_empty_without_invoice_number() {
        assert!(invoice_key("Initech Supplies", None, Decimal::new(100_00, 2), None).is_empty());
        assert!(invoice_key("Initech Supplies", Some("  "), Decimal::new(100_00, 2), None)
            .is_empty());
    }

    #[test]
    fn matching_invoice_and_amount_merges() {
        let candidates = [candidate("item-1", Some("INV-1"), Decimal::new(100_00, 2))];
        let decision = correlate(
            &detection(Some("INV-1"), Decimal::new(100_00, 2)),
            &candidates,
            &CorrelationConfig::default(),
            Utc::now(),
        );

        assert_eq!(
            decision,
            CorrelationDecision::Merge {
                existing: ApItemId("item-1".to_string()),
                reason: MergeReason::InvoiceNumber,
            }
        );
    }

    #[test]
    fn amount_within_tolerance_still_merges() {
        let candidates = [candidate("item-1", Some("INV-1"), Decimal::new(100_00, 2))];
        let decision = correlate(
            &detection(Some("INV-1"), Decimal::new(100_01, 2)),
            &candidates,
            &CorrelationConfig::default(),
            Utc::now(),
        );

        assert!(matches!(decision, CorrelationDecision::Merge { .. }));
    }

    #[test]
    fn material_amount_difference_flags_a_conflict() {
        let candidates = [candidate("item-1", Some("INV-1"), Decimal::new(100_00, 2))];
        let decision = correlate(
            &detection(Some("INV-1"), Decimal::new(250_00, 2)),
            &candidates,
            &CorrelationConfig::default(),
            Utc::now(),
        );

        assert_eq!(
            decision,
            CorrelationDecision::Conflict { flagged_against: ApItemId("item-1".to_string()) }
        );
    }

    #[test]
    fn attachment_hash_merges_without_invoice_number() {
        let mut existing = candidate("item-1", None, Decimal::new(100_00, 2));
        existing.attachment_hashes = vec!["hash-a".to_string()];

        let mut incoming = detection(None, Decimal::new(100_00, 2));
        incoming.attachment_hashes = vec!["hash-b".to_string(), "hash-a".to_string()];

        let decision =
            correlate(&incoming, &[existing], &CorrelationConfig::default(), Utc::now());

        assert_eq!(
            decision,
            CorrelationDecision::Merge {
                existing: ApItemId("item-1".to_string()),
                reason: MergeReason::AttachmentHash,
            }
        );
    }

    #[test]
    fn attachment_match_outside_lookback_window_is_ignored() {
        let mut existing = candidate("item-1", None, Decimal::new(100_00, 2));
        existing.attachment_hashes = vec!["hash-a".to_string()];
        existing.created_at = Utc::now() - Duration::days(45);

        let mut incoming = detection(None, Decimal::new(100_00, 2));
        incoming.attachment_hashes = vec!["hash-a".to_string()];

        let decision =
            correlate(&incoming, &[existing], &CorrelationConfig::default(), Utc::now());

        assert_eq!(decision, CorrelationDecision::NewItem);
    }

    #[test]
    fn unrelated_detection_creates_a_new_item() {
        let candidates = [candidate("item-1", Some("INV-1"), Decimal::new(100_00, 2))];
        let decision = correlate(
            &detection(Some("INV-9"), Decimal::new(100_00, 2)),
            &candidates,
            &CorrelationConfig::default(),
            Utc::now(),
        );

        assert_eq!(decision, CorrelationDecision::NewItem);
    }
}
