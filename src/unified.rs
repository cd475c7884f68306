// 🧾 Unified Transactions - the canonical, deduplicated ledger entries
//
// Identity is the UUID. Canonical values (amount, merchant, date) come from
// the first source that created the entry and are never overwritten by a
// merge; merges only grow the sets and the audit fields.

use crate::record::{CandidateRecord, Direction, SourceKey, SourceKind};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub const INITIAL_MERGE_REASON: &str = "initial creation from single source";

// ============================================================================
// MERGE METADATA
// ============================================================================

/// One source that contributed to a UnifiedTransaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingSource {
    pub key: SourceKey,
    pub fingerprint: String,
    /// Score that caused the merge; None for the creating source
    pub score: Option<f64>,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeMetadata {
    pub sources: Vec<ContributingSource>,
    pub last_merge_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeMetadata {
    pub fn contains(&self, key: &SourceKey) -> bool {
        self.sources.iter().any(|s| &s.key == key)
    }

    pub fn source_keys(&self) -> Vec<SourceKey> {
        self.sources.iter().map(|s| s.key.clone()).collect()
    }
}

// ============================================================================
// UNIFIED TRANSACTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTransaction {
    pub id: Uuid,

    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
    pub direction: Direction,
    pub description: String,

    /// Primary display name
    pub merchant: Option<String>,
    pub merchant_variants: BTreeSet<String>,
    pub reference_ids: BTreeSet<String>,
    pub transaction_date: NaiveDate,
    pub primary_source: SourceKind,

    pub merge_confidence: f64,
    /// Append-only audit log, one line per event
    pub merge_reason: String,
    pub merge_metadata: MergeMetadata,

    /// Explicitly superseded; never deleted
    pub is_duplicate: bool,
    pub duplicate_of: Option<Uuid>,

    /// Optimistic concurrency counter, +1 per committed change
    pub version: i64,
}

impl UnifiedTransaction {
    /// Seed a new entry from a single source record.
    pub fn from_record(record: &CandidateRecord, key: &SourceKey) -> Self {
        let now = Utc::now();

        let mut merchant_variants = BTreeSet::new();
        if let Some(merchant) = record.merchant_name() {
            merchant_variants.insert(merchant.to_string());
        }

        let mut reference_ids = BTreeSet::new();
        if let Some(reference) = record.reference() {
            reference_ids.insert(reference.to_string());
        }

        UnifiedTransaction {
            id: Uuid::new_v4(),
            amount: record.amount,
            currency: record.currency.clone(),
            direction: record.direction,
            description: record.description.clone(),
            merchant: record.merchant_name().map(str::to_string),
            merchant_variants,
            reference_ids,
            transaction_date: record.date,
            primary_source: record.source,
            merge_confidence: 1.0,
            merge_reason: INITIAL_MERGE_REASON.to_string(),
            merge_metadata: MergeMetadata {
                sources: vec![ContributingSource {
                    key: key.clone(),
                    fingerprint: record.fingerprint(),
                    score: None,
                    linked_at: now,
                }],
                last_merge_score: None,
                created_at: now,
                updated_at: now,
            },
            is_duplicate: false,
            duplicate_of: None,
            version: 1,
        }
    }

    /// Fold another source into this entry. Canonical fields stay untouched.
    pub fn absorb(&mut self, record: &CandidateRecord, key: &SourceKey, score: f64, reasons: &[String]) {
        let now = Utc::now();

        if let Some(merchant) = record.merchant_name() {
            self.merchant_variants.insert(merchant.to_string());
        }
        if let Some(reference) = record.reference() {
            self.reference_ids.insert(reference.to_string());
        }

        self.merge_confidence = ((self.merge_confidence + score) / 2.0).clamp(0.0, 1.0);
        self.append_reason(&format!(
            "merged {} at score {:.2} ({})",
            key,
            score,
            reasons.join(", ")
        ));

        self.merge_metadata.sources.push(ContributingSource {
            key: key.clone(),
            fingerprint: record.fingerprint(),
            score: Some(score),
            linked_at: now,
        });
        self.merge_metadata.last_merge_score = Some(score);
        self.merge_metadata.updated_at = now;
    }

    /// Remove a contributing source from the audit metadata (split / reversal).
    pub fn detach(&mut self, key: &SourceKey, split_into: Uuid) {
        self.merge_metadata.sources.retain(|s| &s.key != key);
        self.merge_metadata.updated_at = Utc::now();
        self.append_reason(&format!("split out {} into {}", key, split_into));
    }

    pub fn supersede(&mut self, superseded_by: Uuid) {
        self.is_duplicate = true;
        self.duplicate_of = Some(superseded_by);
        self.merge_metadata.updated_at = Utc::now();
        self.append_reason(&format!("superseded by {}", superseded_by));
    }

    pub fn append_reason(&mut self, line: &str) {
        if !self.merge_reason.is_empty() {
            self.merge_reason.push('\n');
        }
        self.merge_reason.push_str(line);
    }

    pub fn source_count(&self) -> usize {
        self.merge_metadata.sources.len()
    }
}

// ============================================================================
// MERGE DECISION EVENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeAction {
    Created,
    Merged,
}

impl MergeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeAction::Created => "created",
            MergeAction::Merged => "merged",
        }
    }
}

/// Emitted to the ledger/API layer for every create or merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub unified_transaction_id: Uuid,
    pub action: MergeAction,
    /// Best candidate score (0.0 when no candidate was found)
    pub score: f64,
    pub reasons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(source: SourceKind, id: &str, merchant: &str) -> CandidateRecord {
        CandidateRecord::new(
            dec!(500.00),
            "INR",
            Direction::Debit,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            source,
            id,
        )
        .with_merchant(merchant)
    }

    #[test]
    fn test_from_record_seeds_single_source() {
        let r = record(SourceKind::Email, "m1", "Amazon").with_reference("ORD-1");
        let key = r.source_key().unwrap();
        let tx = UnifiedTransaction::from_record(&r, &key);

        assert_eq!(tx.merge_confidence, 1.0);
        assert_eq!(tx.merge_reason, INITIAL_MERGE_REASON);
        assert_eq!(tx.primary_source, SourceKind::Email);
        assert_eq!(tx.version, 1);
        assert!(tx.reference_ids.contains("ORD-1"));
        assert!(tx.merge_metadata.contains(&key));
        assert!(!tx.is_duplicate);
    }

    #[test]
    fn test_absorb_keeps_canonical_fields() {
        let first = record(SourceKind::Email, "m1", "Amazon");
        let mut tx = UnifiedTransaction::from_record(&first, &first.source_key().unwrap());

        let mut second = record(SourceKind::Statement, "s1", "AMAZON PAY");
        second.amount = dec!(499.00);
        second.reference_id = Some("UTR-9".to_string());
        tx.absorb(&second, &second.source_key().unwrap(), 0.8, &["amount within tolerance".to_string()]);

        assert_eq!(tx.amount, dec!(500.00));
        assert_eq!(tx.merchant.as_deref(), Some("Amazon"));
        assert_eq!(tx.merchant_variants.len(), 2);
        assert!(tx.reference_ids.contains("UTR-9"));
        assert!((tx.merge_confidence - 0.9).abs() < 1e-9);
        assert_eq!(tx.source_count(), 2);
        assert_eq!(tx.merge_metadata.last_merge_score, Some(0.8));
        assert!(tx.merge_reason.starts_with(INITIAL_MERGE_REASON));
        assert!(tx.merge_reason.contains("merged statement:s1"));
    }

    #[test]
    fn test_decision_serializes_lowercase_action() {
        let decision = MergeDecision {
            unified_transaction_id: Uuid::nil(),
            action: MergeAction::Merged,
            score: 0.95,
            reasons: vec!["reference id match".to_string()],
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["action"], "merged");
    }
}
