// 🕵️ Pending Review - deduplicate records before they are promoted to the ledger
//
// Same SimilarityScorer, two thresholds, run against the pending queue:
//   score <  flag threshold (0.60)       → Distinct (normal review)
//   flag <= score < auto-merge (0.85)    → Flagged "possible duplicate of X"
//   score >= auto-merge threshold        → AutoMerged into the pending entry
//
// An optional DuplicateAdvisor (AI-assisted check) may refine the best
// candidate's score. Any advisor failure falls back to the heuristic score.

use crate::config::MatchingConfig;
use crate::error::{Result, UnifyError, ValidationError};
use crate::merge::{MergeEngine, MergeOutcome};
use crate::record::{CandidateRecord, Direction, SourceKey};
use crate::scoring::{MatchScore, Scorable, SimilarityScorer};
use crate::store::TransactionStore;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// PENDING RECORD
// ============================================================================

const AUTO_MERGED_REASON: &str = "auto-merged during pending review";
const CONFIRMED_REASON: &str = "confirmed duplicate in pending review";

/// A record folded into a pending entry, with the score that decided it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldedRecord {
    pub record: CandidateRecord,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub id: Uuid,

    /// The record that opened this entry
    pub record: CandidateRecord,

    /// Records auto-merged (or confirmed) into this entry
    pub merged: Vec<FoldedRecord>,

    /// Set while a human still has to decide
    pub possible_duplicate_of: Option<Uuid>,
    pub duplicate_score: Option<f64>,

    pub queued_at: DateTime<Utc>,
}

impl PendingRecord {
    fn new(record: CandidateRecord) -> Self {
        PendingRecord {
            id: Uuid::new_v4(),
            record,
            merged: Vec::new(),
            possible_duplicate_of: None,
            duplicate_score: None,
            queued_at: Utc::now(),
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.possible_duplicate_of.is_some()
    }

    /// The opening record followed by everything folded into it.
    pub fn records(&self) -> impl Iterator<Item = &CandidateRecord> {
        std::iter::once(&self.record).chain(self.merged.iter().map(|folded| &folded.record))
    }

    fn holds(&self, key: &SourceKey) -> bool {
        self.records().any(|r| r.source_key().as_ref() == Some(key))
    }
}

impl Scorable for PendingRecord {
    fn amount(&self) -> Decimal {
        self.record.amount
    }

    fn date(&self) -> NaiveDate {
        self.record.date
    }

    fn direction(&self) -> Direction {
        self.record.direction
    }

    fn merchant(&self) -> Option<&str> {
        self.record.merchant_name()
    }

    fn merchant_variants(&self) -> Vec<&str> {
        let mut variants: Vec<&str> = self.records().filter_map(|r| r.merchant_name()).collect();
        variants.dedup();
        variants
    }

    fn reference_ids(&self) -> Vec<&str> {
        self.records().filter_map(|r| r.reference()).collect()
    }
}

// ============================================================================
// DUPLICATE ADVISOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdvisorError {
    #[error("advisor unavailable: {0}")]
    Unavailable(String),

    #[error("advisor returned malformed output: {0}")]
    Malformed(String),
}

/// External (e.g. AI-assisted) duplicate check. Only ever refines the heuristic.
pub trait DuplicateAdvisor: Send + Sync {
    /// Probability in [0, 1] that `incoming` and `existing` are the same event.
    fn assess(
        &self,
        incoming: &CandidateRecord,
        existing: &PendingRecord,
    ) -> std::result::Result<f64, AdvisorError>;
}

// ============================================================================
// DECISIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PendingDecision {
    /// Queued as its own entry for normal review
    Distinct { id: Uuid },

    /// Queued with a "possible duplicate of" annotation
    Flagged { id: Uuid, duplicate_of: Uuid, score: f64 },

    /// Folded into an existing pending entry without review
    AutoMerged { into: Uuid, score: f64 },

    /// Same (source, source_id) already sits in the queue
    AlreadyQueued { id: Uuid },
}

impl PendingDecision {
    /// Pending entry the record ended up in.
    pub fn entry_id(&self) -> Uuid {
        match self {
            PendingDecision::Distinct { id }
            | PendingDecision::Flagged { id, .. }
            | PendingDecision::AlreadyQueued { id } => *id,
            PendingDecision::AutoMerged { into, .. } => *into,
        }
    }
}

// ============================================================================
// PENDING QUEUE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    entries: Vec<PendingRecord>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PendingRecord] {
        &self.entries
    }

    pub fn get(&self, id: Uuid) -> Option<&PendingRecord> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn flagged(&self) -> Vec<&PendingRecord> {
        self.entries.iter().filter(|e| e.is_flagged()).collect()
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut PendingRecord> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| UnifyError::not_found(format!("pending record {}", id)))
    }

    fn take(&mut self, id: Uuid) -> Result<PendingRecord> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| UnifyError::not_found(format!("pending record {}", id)))?;
        Ok(self.entries.remove(index))
    }

    /// Promote an entry to the ledger. The opening record goes through the
    /// merge engine; everything folded into it is attached to the same
    /// transaction, keeping the merge decided during review.
    pub fn approve<S: TransactionStore + ?Sized>(
        &mut self,
        id: Uuid,
        engine: &MergeEngine,
        store: &mut S,
    ) -> Result<Vec<MergeOutcome>> {
        let entry = self.get(id).ok_or_else(|| UnifyError::not_found(format!("pending record {}", id)))?;

        let mut outcomes = Vec::with_capacity(entry.merged.len() + 1);
        let opening = engine.ingest(&entry.record, store)?;
        let target = opening.transaction.id;
        outcomes.push(opening);

        for folded in &entry.merged {
            outcomes.push(engine.attach(store, target, &folded.record, folded.score, &folded.reason)?);
        }

        // Removed only once every record is in the ledger; a retry replays the committed ones
        self.take(id)?;
        for other in self.entries.iter_mut() {
            if other.possible_duplicate_of == Some(id) {
                other.possible_duplicate_of = None;
                other.duplicate_score = None;
            }
        }

        info!(pending = %id, transaction = %target, records = outcomes.len(), "pending record approved");
        Ok(outcomes)
    }

    /// Resolve a flag as "yes, same event": fold the flagged entry into its suspected duplicate.
    pub fn confirm_duplicate(&mut self, id: Uuid) -> Result<Uuid> {
        let flagged = self
            .get(id)
            .ok_or_else(|| UnifyError::not_found(format!("pending record {}", id)))?;
        let target = flagged
            .possible_duplicate_of
            .ok_or_else(|| ValidationError::new("pending", format!("{} is not flagged", id)))?;

        if self.get(target).is_none() {
            return Err(UnifyError::not_found(format!("pending record {}", target)));
        }

        let flagged = self.take(id)?;
        let score = flagged.duplicate_score.unwrap_or(0.0);
        let survivor = self.get_mut(target)?;
        survivor.merged.push(FoldedRecord {
            record: flagged.record,
            score,
            reason: CONFIRMED_REASON.to_string(),
        });
        survivor.merged.extend(flagged.merged);

        info!(pending = %id, into = %target, "duplicate confirmed");
        Ok(target)
    }

    /// Resolve a flag as "distinct": keep the entry, drop the annotation.
    pub fn dismiss_flag(&mut self, id: Uuid) -> Result<()> {
        let entry = self.get_mut(id)?;
        if !entry.is_flagged() {
            return Err(ValidationError::new("pending", format!("{} is not flagged", id)).into());
        }
        entry.possible_duplicate_of = None;
        entry.duplicate_score = None;
        Ok(())
    }
}

// ============================================================================
// PENDING REVIEWER
// ============================================================================

pub struct PendingReviewer {
    pub scorer: SimilarityScorer,

    /// Flag as possible duplicate at or above (default: 0.60)
    pub flag_threshold: f64,

    /// Auto-merge at or above (default: 0.85)
    pub auto_merge_threshold: f64,

    advisor: Option<Box<dyn DuplicateAdvisor>>,
}

impl PendingReviewer {
    pub fn new() -> Self {
        Self::from_config(&MatchingConfig::default())
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        PendingReviewer {
            scorer: SimilarityScorer::from_config(config),
            flag_threshold: config.pending_flag_threshold,
            auto_merge_threshold: config.pending_auto_merge_threshold,
            advisor: None,
        }
    }

    pub fn with_advisor(mut self, advisor: Box<dyn DuplicateAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Queue a record, folding it into an existing entry when it is clearly the same event.
    pub fn submit(&self, queue: &mut PendingQueue, record: CandidateRecord) -> Result<PendingDecision> {
        record.validate()?;

        if let Some(key) = record.source_key() {
            if let Some(existing) = queue.entries.iter().find(|e| e.holds(&key)) {
                debug!(source = %key, pending = %existing.id, "already queued");
                return Ok(PendingDecision::AlreadyQueued { id: existing.id });
            }
        }

        let best = queue
            .entries
            .iter()
            .map(|entry| (entry, self.scorer.score(&record, entry)))
            .max_by(|(_, a), (_, b)| a.score.total_cmp(&b.score))
            .map(|(entry, heuristic)| (entry.id, self.refine(&record, entry, heuristic)));

        match best {
            Some((target, score)) if score >= self.auto_merge_threshold => {
                queue.get_mut(target)?.merged.push(FoldedRecord {
                    record,
                    score,
                    reason: AUTO_MERGED_REASON.to_string(),
                });
                info!(into = %target, score, "pending record auto-merged");
                Ok(PendingDecision::AutoMerged { into: target, score })
            }
            Some((target, score)) if score >= self.flag_threshold => {
                let mut entry = PendingRecord::new(record);
                entry.possible_duplicate_of = Some(target);
                entry.duplicate_score = Some(score);
                let id = entry.id;
                queue.entries.push(entry);
                info!(pending = %id, duplicate_of = %target, score, "possible duplicate flagged");
                Ok(PendingDecision::Flagged {
                    id,
                    duplicate_of: target,
                    score,
                })
            }
            _ => {
                let entry = PendingRecord::new(record);
                let id = entry.id;
                queue.entries.push(entry);
                Ok(PendingDecision::Distinct { id })
            }
        }
    }

    /// Advisor verdict when it is usable, heuristic score otherwise.
    fn refine(&self, record: &CandidateRecord, entry: &PendingRecord, heuristic: MatchScore) -> f64 {
        let Some(advisor) = &self.advisor else {
            return heuristic.score;
        };

        match advisor.assess(record, entry) {
            Ok(score) if score.is_finite() && (0.0..=1.0).contains(&score) => score,
            Ok(score) => {
                warn!(pending = %entry.id, score, "advisor score out of range, using heuristic");
                heuristic.score
            }
            Err(err) => {
                warn!(pending = %entry.id, error = %err, "advisor failed, using heuristic");
                heuristic.score
            }
        }
    }
}

impl Default for PendingReviewer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourceKind;
    use crate::store::MemoryStore;
    use crate::unified::MergeAction;
    use rust_decimal_macros::dec;

    fn record(amount: Decimal, day: u32, merchant: &str, source: SourceKind, id: &str) -> CandidateRecord {
        CandidateRecord::new(
            amount,
            "INR",
            Direction::Debit,
            NaiveDate::from_ymd_opt(2024, 2, day).unwrap(),
            source,
            id,
        )
        .with_merchant(merchant)
    }

    struct FixedAdvisor(std::result::Result<f64, AdvisorError>);

    impl DuplicateAdvisor for FixedAdvisor {
        fn assess(&self, _: &CandidateRecord, _: &PendingRecord) -> std::result::Result<f64, AdvisorError> {
            self.0.clone()
        }
    }

    #[test]
    fn test_three_bands() {
        let reviewer = PendingReviewer::new();
        let mut queue = PendingQueue::new();

        let first = reviewer
            .submit(&mut queue, record(dec!(750.00), 10, "Uber", SourceKind::Email, "m1"))
            .unwrap();
        assert!(matches!(first, PendingDecision::Distinct { .. }));

        // 0.30 + 0.25 + 0.25 + 0.10 (+ variant) → auto-merge
        let same = reviewer
            .submit(&mut queue, record(dec!(750.00), 10, "UBER", SourceKind::Statement, "s1"))
            .unwrap();
        assert_eq!(
            same,
            PendingDecision::AutoMerged {
                into: first.entry_id(),
                score: 1.0
            }
        );

        // 0.30 + 0.15 + 0.10 + merchant miss = 0.55 → distinct
        let far = reviewer
            .submit(&mut queue, record(dec!(750.00), 12, "Ola", SourceKind::Ocr, "d1"))
            .unwrap();
        assert!(matches!(far, PendingDecision::Distinct { .. }));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(first.entry_id()).unwrap().merged.len(), 1);
    }

    #[test]
    fn test_flag_band_and_review_actions() {
        let reviewer = PendingReviewer::new();
        let mut queue = PendingQueue::new();

        let base = reviewer
            .submit(&mut queue, record(dec!(200.00), 10, "Starbucks", SourceKind::Email, "m1"))
            .unwrap();

        // amount 0.30 + date window 0.15 + direction 0.10 + fuzzy merchant 0.15 = 0.70
        let flagged = reviewer
            .submit(&mut queue, record(dec!(200.00), 11, "Starbucks Coffee", SourceKind::Api, "a1"))
            .unwrap();
        let flagged_id = match flagged {
            PendingDecision::Flagged { id, duplicate_of, score } => {
                assert_eq!(duplicate_of, base.entry_id());
                assert!((score - 0.70).abs() < 1e-9);
                id
            }
            other => panic!("expected flag, got {:?}", other),
        };
        assert_eq!(queue.flagged().len(), 1);

        queue.dismiss_flag(flagged_id).unwrap();
        assert!(queue.flagged().is_empty());
        assert!(queue.dismiss_flag(flagged_id).is_err());
        assert!(queue.confirm_duplicate(flagged_id).is_err());
    }

    #[test]
    fn test_confirm_duplicate_folds_entry() {
        let reviewer = PendingReviewer::new();
        let mut queue = PendingQueue::new();

        let base = reviewer
            .submit(&mut queue, record(dec!(200.00), 10, "Starbucks", SourceKind::Email, "m1"))
            .unwrap();
        let flagged = reviewer
            .submit(&mut queue, record(dec!(200.00), 11, "Starbucks Coffee", SourceKind::Api, "a1"))
            .unwrap();

        let into = queue.confirm_duplicate(flagged.entry_id()).unwrap();
        assert_eq!(into, base.entry_id());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(into).unwrap().merged.len(), 1);
    }

    #[test]
    fn test_already_queued_source() {
        let reviewer = PendingReviewer::new();
        let mut queue = PendingQueue::new();
        let r = record(dec!(10.00), 1, "Metro", SourceKind::Manual, "entry-1");

        let first = reviewer.submit(&mut queue, r.clone()).unwrap();
        let again = reviewer.submit(&mut queue, r).unwrap();
        assert_eq!(again, PendingDecision::AlreadyQueued { id: first.entry_id() });
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_advisor_refines_score() {
        let reviewer = PendingReviewer::new().with_advisor(Box::new(FixedAdvisor(Ok(0.9))));
        let mut queue = PendingQueue::new();

        let base = reviewer
            .submit(&mut queue, record(dec!(200.00), 10, "Starbucks", SourceKind::Email, "m1"))
            .unwrap();
        let second = reviewer
            .submit(&mut queue, record(dec!(200.00), 11, "Starbucks Coffee", SourceKind::Api, "a1"))
            .unwrap();
        assert_eq!(
            second,
            PendingDecision::AutoMerged {
                into: base.entry_id(),
                score: 0.9
            }
        );
    }

    #[test]
    fn test_advisor_failure_falls_back_to_heuristic() {
        for advisor in [
            FixedAdvisor(Err(AdvisorError::Unavailable("timeout".into()))),
            FixedAdvisor(Ok(f64::NAN)),
            FixedAdvisor(Ok(1.7)),
        ] {
            let reviewer = PendingReviewer::new().with_advisor(Box::new(advisor));
            let mut queue = PendingQueue::new();

            reviewer
                .submit(&mut queue, record(dec!(200.00), 10, "Starbucks", SourceKind::Email, "m1"))
                .unwrap();
            let second = reviewer
                .submit(&mut queue, record(dec!(200.00), 11, "Starbucks Coffee", SourceKind::Api, "a1"))
                .unwrap();
            assert!(matches!(second, PendingDecision::Flagged { .. }));
        }
    }

    #[test]
    fn test_approve_promotes_all_records() {
        let reviewer = PendingReviewer::new();
        let engine = MergeEngine::new();
        let mut queue = PendingQueue::new();
        let mut store = MemoryStore::new();

        let entry = reviewer
            .submit(&mut queue, record(dec!(750.00), 10, "Uber", SourceKind::Email, "m1"))
            .unwrap();
        reviewer
            .submit(&mut queue, record(dec!(750.00), 10, "UBER", SourceKind::Statement, "s1"))
            .unwrap();

        let outcomes = queue.approve(entry.entry_id(), &engine, &mut store).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].action(), Some(MergeAction::Created));
        assert_eq!(outcomes[1].action(), Some(MergeAction::Merged));
        assert_eq!(outcomes[0].transaction.id, outcomes[1].transaction.id);
        assert!(queue.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_approve_keeps_confirmed_duplicate_merged() {
        let reviewer = PendingReviewer::new();
        let engine = MergeEngine::new();
        let mut queue = PendingQueue::new();
        let mut store = MemoryStore::new();

        // 0.70: flagged, and also below the ledger's own merge threshold
        let base = reviewer
            .submit(&mut queue, record(dec!(200.00), 10, "Starbucks", SourceKind::Email, "m1"))
            .unwrap();
        let flagged = reviewer
            .submit(&mut queue, record(dec!(200.00), 11, "Starbucks Coffee", SourceKind::Api, "a1"))
            .unwrap();
        queue.confirm_duplicate(flagged.entry_id()).unwrap();

        let outcomes = queue.approve(base.entry_id(), &engine, &mut store).unwrap();
        let actions: Vec<_> = outcomes.iter().map(|o| o.action()).collect();
        assert_eq!(actions, vec![Some(MergeAction::Created), Some(MergeAction::Merged)]);
        assert_eq!(outcomes[0].transaction.id, outcomes[1].transaction.id);
        assert_eq!(store.len(), 1);
        assert_eq!(store.link_count(), 2);

        let merged = &outcomes[1].transaction;
        assert!(merged.merchant_variants.contains("Starbucks Coffee"));
        assert!(merged.merge_reason.contains(CONFIRMED_REASON));
        assert!((merged.merge_confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_approve_keeps_advisor_auto_merge() {
        let reviewer = PendingReviewer::new().with_advisor(Box::new(FixedAdvisor(Ok(0.9))));
        let engine = MergeEngine::new();
        let mut queue = PendingQueue::new();
        let mut store = MemoryStore::new();

        let base = reviewer
            .submit(&mut queue, record(dec!(200.00), 10, "Starbucks", SourceKind::Email, "m1"))
            .unwrap();
        let second = reviewer
            .submit(&mut queue, record(dec!(200.00), 11, "Starbucks Coffee", SourceKind::Api, "a1"))
            .unwrap();
        assert!(matches!(second, PendingDecision::AutoMerged { .. }));

        let outcomes = queue.approve(base.entry_id(), &engine, &mut store).unwrap();
        assert_eq!(outcomes[1].action(), Some(MergeAction::Merged));
        assert_eq!(outcomes[1].decision.as_ref().unwrap().score, 0.9);
        assert_eq!(store.len(), 1);
    }
}
