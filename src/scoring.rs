// 🎯 Similarity Scorer - weighted, additive, clamped to 1.0
//
//   reference id intersect → 0.95, stop
//   amount     exact +0.30 | within tolerance +0.20
//   date       same day +0.25 | within window +0.15
//   merchant   exact +0.25 | ratio >= 0.70 +0.15
//              + variant ratio >= 0.95 +0.10 (stacks)
//   direction  match +0.10
//
// Downstream thresholds (0.60 / 0.75 / 0.85) are calibrated against this
// exact weight table. Pure and symmetric: score(a, b) == score(b, a).

use crate::config::MatchingConfig;
use crate::record::{CandidateRecord, Direction};
use crate::unified::UnifiedTransaction;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const REFERENCE_MATCH_SCORE: f64 = 0.95;
pub const AMOUNT_EXACT_WEIGHT: f64 = 0.30;
pub const AMOUNT_TOLERANCE_WEIGHT: f64 = 0.20;
pub const DATE_SAME_DAY_WEIGHT: f64 = 0.25;
pub const DATE_WINDOW_WEIGHT: f64 = 0.15;
pub const MERCHANT_EXACT_WEIGHT: f64 = 0.25;
pub const MERCHANT_FUZZY_WEIGHT: f64 = 0.15;
pub const MERCHANT_VARIANT_WEIGHT: f64 = 0.10;
pub const DIRECTION_WEIGHT: f64 = 0.10;

pub const FUZZY_MERCHANT_RATIO: f64 = 0.70;
pub const VARIANT_MERCHANT_RATIO: f64 = 0.95;

// ============================================================================
// COMPARABLE VIEW
// ============================================================================

/// The fields scoring looks at. Implemented by everything that can be compared.
pub trait Scorable {
    fn amount(&self) -> Decimal;
    fn date(&self) -> NaiveDate;
    fn direction(&self) -> Direction;
    fn merchant(&self) -> Option<&str>;
    /// Merchant spellings already recorded from other sources
    fn merchant_variants(&self) -> Vec<&str>;
    fn reference_ids(&self) -> Vec<&str>;
}

impl Scorable for CandidateRecord {
    fn amount(&self) -> Decimal {
        self.amount
    }

    fn date(&self) -> NaiveDate {
        self.date
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn merchant(&self) -> Option<&str> {
        self.merchant_name()
    }

    fn merchant_variants(&self) -> Vec<&str> {
        Vec::new()
    }

    fn reference_ids(&self) -> Vec<&str> {
        self.reference().into_iter().collect()
    }
}

impl Scorable for UnifiedTransaction {
    fn amount(&self) -> Decimal {
        self.amount
    }

    fn date(&self) -> NaiveDate {
        self.transaction_date
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn merchant(&self) -> Option<&str> {
        self.merchant.as_deref()
    }

    fn merchant_variants(&self) -> Vec<&str> {
        self.merchant_variants.iter().map(String::as_str).collect()
    }

    fn reference_ids(&self) -> Vec<&str> {
        self.reference_ids
            .iter()
            .map(String::as_str)
            .filter(|r| !r.trim().is_empty())
            .collect()
    }
}

// ============================================================================
// MATCH SCORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    /// Confidence in [0, 1]
    pub score: f64,
    /// Human-readable contributions, in evaluation order
    pub reasons: Vec<String>,
}

impl MatchScore {
    pub fn none() -> Self {
        MatchScore {
            score: 0.0,
            reasons: Vec::new(),
        }
    }
}

// ============================================================================
// SIMILARITY SCORER
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimilarityScorer {
    /// Relative amount tolerance (default: 1%)
    pub amount_tolerance: Decimal,

    /// Date window in days (default: ±2)
    pub date_window_days: i64,
}

impl SimilarityScorer {
    pub fn new() -> Self {
        Self::from_config(&MatchingConfig::default())
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        SimilarityScorer {
            amount_tolerance: config.amount_tolerance,
            date_window_days: config.date_window_days,
        }
    }

    pub fn score<A: Scorable + ?Sized, B: Scorable + ?Sized>(&self, a: &A, b: &B) -> MatchScore {
        // Step 1: reference id short-circuit
        let refs_a = a.reference_ids();
        let refs_b = b.reference_ids();
        if let Some(shared) = refs_a.iter().find(|r| refs_b.contains(*r)) {
            return MatchScore {
                score: REFERENCE_MATCH_SCORE,
                reasons: vec![format!("reference id match: {}", shared)],
            };
        }

        let mut score = 0.0;
        let mut reasons = Vec::new();

        // Step 2: amount
        let (amount_a, amount_b) = (a.amount(), b.amount());
        if amount_a == amount_b {
            score += AMOUNT_EXACT_WEIGHT;
            reasons.push("amount exact match".to_string());
        } else if self.amounts_within_tolerance(amount_a, amount_b) {
            score += AMOUNT_TOLERANCE_WEIGHT;
            reasons.push(format!("amount within tolerance ({} vs {})", amount_a, amount_b));
        }

        // Step 3: date
        let days_apart = (a.date() - b.date()).num_days().abs();
        if days_apart == 0 {
            score += DATE_SAME_DAY_WEIGHT;
            reasons.push("same date".to_string());
        } else if days_apart <= self.date_window_days {
            score += DATE_WINDOW_WEIGHT;
            reasons.push(format!("date within {} day(s)", days_apart));
        }

        // Step 4: merchant
        if let (Some(merchant_a), Some(merchant_b)) = (a.merchant(), b.merchant()) {
            if merchant_a.trim().to_lowercase() == merchant_b.trim().to_lowercase() {
                score += MERCHANT_EXACT_WEIGHT;
                reasons.push("merchant exact match".to_string());
            } else {
                let ratio = similarity_ratio(merchant_a, merchant_b);
                if ratio >= FUZZY_MERCHANT_RATIO {
                    score += MERCHANT_FUZZY_WEIGHT;
                    reasons.push(format!(
                        "merchant similar ({} ~ {}, ratio {:.2})",
                        merchant_a, merchant_b, ratio
                    ));
                }
            }
        }

        if let Some(variant) = variant_match(a, b).or_else(|| variant_match(b, a)) {
            score += MERCHANT_VARIANT_WEIGHT;
            reasons.push(format!("merchant matches known variant '{}'", variant));
        }

        // Step 5: direction
        if a.direction() == b.direction() {
            score += DIRECTION_WEIGHT;
            reasons.push(format!("direction match ({})", a.direction().as_str()));
        }

        MatchScore {
            score: f64::min(score, 1.0),
            reasons,
        }
    }

    /// Score a record against every candidate. Order of the output follows the input.
    pub fn score_all<A: Scorable, B: Scorable>(&self, record: &A, candidates: &[B]) -> Vec<MatchScore> {
        candidates.iter().map(|c| self.score(record, c)).collect()
    }

    /// |a - b| <= tolerance * min(a, b)
    pub fn amounts_within_tolerance(&self, a: Decimal, b: Decimal) -> bool {
        let base = a.min(b).abs();
        (a - b).abs() <= base * self.amount_tolerance
    }
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self::new()
    }
}

/// First recorded variant of `owner` that `other`'s merchant matches at >= 0.95.
fn variant_match<'a, A: Scorable + ?Sized, B: Scorable + ?Sized>(
    other: &A,
    owner: &'a B,
) -> Option<&'a str> {
    let merchant = other.merchant()?;
    owner
        .merchant_variants()
        .into_iter()
        .find(|variant| similarity_ratio(merchant, variant) >= VARIANT_MERCHANT_RATIO)
}

// ============================================================================
// FUZZY RATIO
// ============================================================================

/// Normalized indel similarity: 2 * LCS / (len_a + len_b), case-insensitive.
///
/// Examples:
/// - similarity_ratio("amzn", "amazon") = 0.8
/// - similarity_ratio("uber", "UBER") = 1.0
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.trim().to_lowercase().chars().collect();
    let b: Vec<char> = b.trim().to_lowercase().chars().collect();

    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    (2 * longest_common_subsequence(&a, &b)) as f64 / total as f64
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourceKind;
    use rust_decimal_macros::dec;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn record(amount: Decimal, day: u32, merchant: &str) -> CandidateRecord {
        CandidateRecord::new(amount, "INR", Direction::Debit, date(day), SourceKind::Email, "x")
            .with_merchant(merchant)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_similarity_ratio() {
        assert_close(similarity_ratio("", ""), 1.0);
        assert_close(similarity_ratio("abc", ""), 0.0);
        assert_close(similarity_ratio("Uber", "UBER"), 1.0);
        assert_close(similarity_ratio("amzn", "Amazon"), 0.8);
        assert_close(similarity_ratio("starbucks", "amazon"), 2.0 / 15.0);
    }

    #[test]
    fn test_identical_records_score_full() {
        let scorer = SimilarityScorer::new();
        let a = record(dec!(45.99), 15, "Starbucks");
        let b = record(dec!(45.99), 15, "STARBUCKS");

        let result = scorer.score(&a, &b);
        // 0.30 + 0.25 + 0.25 + 0.10 = 0.90 (no recorded variants on plain records)
        assert_close(result.score, 0.90);
        assert_eq!(result.reasons.len(), 4);
    }

    #[test]
    fn test_score_clamped_with_variant_bonus() {
        let scorer = SimilarityScorer::new();
        let a = record(dec!(45.99), 15, "Starbucks");
        let existing = UnifiedTransaction::from_record(&a, &a.source_key().unwrap());

        let b = record(dec!(45.99), 15, "starbucks");
        let result = scorer.score(&b, &existing);
        assert_close(result.score, 1.0);
        assert!(result.reasons.iter().any(|r| r.contains("known variant")));
    }

    #[test]
    fn test_reference_short_circuit_ignores_mismatches() {
        let scorer = SimilarityScorer::new();
        let a = record(dec!(10.00), 1, "Flipkart").with_reference("UTR-778");
        let mut b = record(dec!(9999.00), 28, "Totally Different").with_reference("UTR-778");
        b.direction = Direction::Credit;

        let result = scorer.score(&a, &b);
        assert!(result.score >= 0.95);
        assert_eq!(result.reasons, vec!["reference id match: UTR-778".to_string()]);
    }

    #[test]
    fn test_different_references_do_not_short_circuit() {
        let scorer = SimilarityScorer::new();
        let a = record(dec!(10.00), 1, "Flipkart").with_reference("UTR-1");
        let b = record(dec!(10.00), 1, "Flipkart").with_reference("UTR-2");

        let result = scorer.score(&a, &b);
        assert_close(result.score, 0.90);
    }

    #[test]
    fn test_fuzzy_threshold_boundary_inclusive() {
        let scorer = SimilarityScorer::new();

        // 2 * 70 / 200 = 0.70 exactly
        let at = |tail: &str| format!("{}{}", "a".repeat(70), tail.repeat(30));
        let a = record(dec!(1.00), 1, &at("b"));
        let b = record(dec!(1.00), 1, &at("c"));
        assert_close(similarity_ratio(a.merchant.as_deref().unwrap(), b.merchant.as_deref().unwrap()), 0.70);
        let with_bonus = scorer.score(&a, &b);
        assert_close(with_bonus.score, 0.30 + 0.25 + 0.15 + 0.10);

        // 2 * 69 / 200 = 0.69
        let below = |tail: &str| format!("{}{}", "a".repeat(69), tail.repeat(31));
        let c = record(dec!(1.00), 1, &below("b"));
        let d = record(dec!(1.00), 1, &below("c"));
        let without_bonus = scorer.score(&c, &d);
        assert_close(without_bonus.score, 0.30 + 0.25 + 0.10);
    }

    #[test]
    fn test_amount_tolerance_boundary() {
        let scorer = SimilarityScorer::new();

        // exactly 1.0% apart
        let a = record(dec!(100.00), 1, "Shop");
        let b = record(dec!(101.00), 1, "Shop");
        let result = scorer.score(&a, &b);
        assert_close(result.score, 0.20 + 0.25 + 0.25 + 0.10);

        // 1.01% apart
        let c = record(dec!(101.01), 1, "Shop");
        let result = scorer.score(&a, &c);
        assert_close(result.score, 0.25 + 0.25 + 0.10);
    }

    #[test]
    fn test_date_window() {
        let scorer = SimilarityScorer::new();
        let a = record(dec!(5.00), 10, "Cafe");

        let two_days = scorer.score(&a, &record(dec!(5.00), 12, "Cafe"));
        assert_close(two_days.score, 0.30 + 0.15 + 0.25 + 0.10);

        let three_days = scorer.score(&a, &record(dec!(5.00), 13, "Cafe"));
        assert_close(three_days.score, 0.30 + 0.25 + 0.10);
    }

    #[test]
    fn test_missing_merchant_scores_nothing_for_merchant() {
        let scorer = SimilarityScorer::new();
        let a = record(dec!(5.00), 10, "Cafe");
        let mut b = a.clone();
        b.merchant = None;

        let result = scorer.score(&a, &b);
        assert_close(result.score, 0.30 + 0.25 + 0.10);
    }

    #[test]
    fn test_symmetry() {
        let scorer = SimilarityScorer::new();
        let seed = record(dec!(500.00), 15, "Amazon");
        let mut existing = UnifiedTransaction::from_record(&seed, &seed.source_key().unwrap());
        existing.merchant_variants.insert("AMZN Mktp".to_string());

        let pairs = vec![
            (record(dec!(500.00), 16, "AMZN"), record(dec!(500.00), 15, "Amazon")),
            (record(dec!(100.00), 1, "Shop"), record(dec!(101.00), 2, "Shopp")),
            (record(dec!(7.00), 3, "Uber"), record(dec!(70.00), 9, "Lyft")),
        ];
        for (a, b) in &pairs {
            assert_eq!(scorer.score(a, b).score, scorer.score(b, a).score);
        }

        let probe = record(dec!(500.00), 16, "amzn mktp");
        assert_eq!(scorer.score(&probe, &existing).score, scorer.score(&existing, &probe).score);
    }

    #[test]
    fn test_score_all_preserves_order() {
        let scorer = SimilarityScorer::new();
        let probe = record(dec!(20.00), 5, "Zomato");
        let candidates = vec![
            record(dec!(20.00), 5, "Zomato"),
            record(dec!(999.00), 20, "Other"),
        ];

        let scores = scorer.score_all(&probe, &candidates);
        assert_eq!(scores.len(), 2);
        assert!(scores[0].score > scores[1].score);
    }
}
