// 🔎 Candidate Finder - bounded candidate search before scoring
//
// Union of:
//   (a) date within ±window AND amount within ±tolerance AND same direction
//   (b) any transaction already carrying the record's reference id
// Scoring only ever runs against this set, never the full history.

use crate::config::MatchingConfig;
use crate::error::Result;
use crate::record::CandidateRecord;
use crate::store::{CandidateWindow, TransactionStore};
use crate::unified::UnifiedTransaction;
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct CandidateFinder {
    /// Relative amount tolerance (default: 1%)
    pub amount_tolerance: Decimal,

    /// Date window in days (default: ±2)
    pub date_window_days: i64,
}

impl CandidateFinder {
    pub fn new() -> Self {
        Self::from_config(&MatchingConfig::default())
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        CandidateFinder {
            amount_tolerance: config.amount_tolerance,
            date_window_days: config.date_window_days,
        }
    }

    /// Window around a record: date ± days, amount * (1 ± tolerance), same direction.
    /// Bounds saturate at the ends of the date and decimal ranges.
    pub fn window_for(&self, record: &CandidateRecord) -> CandidateWindow {
        let days = Days::new(self.date_window_days.unsigned_abs());
        let spread = record
            .amount
            .checked_mul(self.amount_tolerance)
            .unwrap_or(Decimal::MAX);

        CandidateWindow {
            date_from: record.date.checked_sub_days(days).unwrap_or(NaiveDate::MIN),
            date_to: record.date.checked_add_days(days).unwrap_or(NaiveDate::MAX),
            amount_min: record.amount.checked_sub(spread).unwrap_or(Decimal::MIN),
            amount_max: record.amount.checked_add(spread).unwrap_or(Decimal::MAX),
            direction: record.direction,
        }
    }

    /// Unordered, de-duplicated candidate set. Empty is a normal result.
    pub fn find<S: TransactionStore + ?Sized>(
        &self,
        record: &CandidateRecord,
        store: &S,
    ) -> Result<Vec<UnifiedTransaction>> {
        let mut candidates = store.in_window(&self.window_for(record))?;

        if let Some(reference) = record.reference() {
            candidates.extend(store.with_reference(reference)?);
        }

        let mut seen = HashSet::new();
        candidates.retain(|tx| seen.insert(tx.id));

        tracing::debug!(
            source = %record.source,
            source_id = %record.source_id,
            candidates = candidates.len(),
            "candidate search complete"
        );

        Ok(candidates)
    }
}

impl Default for CandidateFinder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Direction, SourceKind};
    use crate::store::{MemoryStore, SourceLink, StoreWrite};
    use rust_decimal_macros::dec;

    fn record(amount: Decimal, day: u32, id: &str) -> CandidateRecord {
        CandidateRecord::new(
            amount,
            "INR",
            Direction::Debit,
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            SourceKind::Email,
            id,
        )
    }

    fn seed(store: &mut MemoryStore, r: CandidateRecord) -> UnifiedTransaction {
        let key = r.source_key().unwrap();
        let tx = UnifiedTransaction::from_record(&r, &key);
        store
            .commit(StoreWrite::Create {
                transaction: tx.clone(),
                link: SourceLink { key, record: r },
                snapshot: None,
            })
            .unwrap();
        tx
    }

    #[test]
    fn test_window_bounds() {
        let finder = CandidateFinder::new();
        let window = finder.window_for(&record(dec!(200.00), 15, "a"));

        assert_eq!(window.date_from, NaiveDate::from_ymd_opt(2024, 1, 13).unwrap());
        assert_eq!(window.date_to, NaiveDate::from_ymd_opt(2024, 1, 17).unwrap());
        assert_eq!(window.amount_min, dec!(198.00));
        assert_eq!(window.amount_max, dec!(202.00));
    }

    #[test]
    fn test_window_saturates_at_range_edges() {
        let finder = CandidateFinder::new();

        let mut huge = record(Decimal::MAX, 15, "huge");
        huge.date = NaiveDate::MIN;
        let window = finder.window_for(&huge);
        assert_eq!(window.amount_max, Decimal::MAX);
        assert!(window.amount_min < Decimal::MAX);
        assert_eq!(window.date_from, NaiveDate::MIN);
        assert_eq!(window.date_to, NaiveDate::MIN.checked_add_days(Days::new(2)).unwrap());

        let mut late = record(dec!(10.00), 15, "late");
        late.date = NaiveDate::MAX;
        let window = finder.window_for(&late);
        assert_eq!(window.date_to, NaiveDate::MAX);
        assert_eq!(window.date_from, NaiveDate::MAX.checked_sub_days(Days::new(2)).unwrap());
    }

    #[test]
    fn test_find_by_window() {
        let finder = CandidateFinder::new();
        let mut store = MemoryStore::new();
        let inside = seed(&mut store, record(dec!(201.00), 17, "in"));
        seed(&mut store, record(dec!(200.00), 18, "too-late"));
        seed(&mut store, record(dec!(203.00), 15, "too-expensive"));

        let mut credit = record(dec!(200.00), 15, "credit");
        credit.direction = Direction::Credit;
        seed(&mut store, credit);

        let found = finder.find(&record(dec!(200.00), 15, "probe"), &store).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, inside.id);
    }

    #[test]
    fn test_find_by_reference_outside_window() {
        let finder = CandidateFinder::new();
        let mut store = MemoryStore::new();
        let far = seed(
            &mut store,
            record(dec!(999.00), 1, "far").with_reference("INV-42"),
        );

        let probe = record(dec!(10.00), 28, "probe").with_reference("INV-42");
        let found = finder.find(&probe, &store).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, far.id);
    }

    #[test]
    fn test_find_deduplicates_union() {
        let finder = CandidateFinder::new();
        let mut store = MemoryStore::new();
        seed(&mut store, record(dec!(50.00), 10, "both").with_reference("ORD-7"));

        let probe = record(dec!(50.00), 10, "probe").with_reference("ORD-7");
        assert_eq!(finder.find(&probe, &store).unwrap().len(), 1);
    }

    #[test]
    fn test_find_empty_store() {
        let finder = CandidateFinder::new();
        let store = MemoryStore::new();
        assert!(finder
            .find(&record(dec!(1.00), 1, "x"), &store)
            .unwrap()
            .is_empty());
    }
}
