// 🏦 Account Pattern Matcher - which account does a record belong to?
//
// resolve(hint):
//   1. Learned patterns (highest confidence, then usage) → auto-resolve.
//      A pattern matched only on weak signals yields to card digits that
//      belong to another account.
//   2. Heuristics: last 4 digits (0.9), wallet (0.8), institution (0.7)
//      → auto-resolve only when exactly one account reaches 0.9
//   3. Otherwise: ranked suggestions, no account (a human decides)
//
// learn(hint, account): human confirmation/correction feeds the patterns.

use crate::entities::{Account, AccountRegistry, LearnedAccountPattern, PatternRegistry, PatternSignal};
use crate::error::{Result, UnifyError};
use crate::record::{AccountHint, CandidateRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

// ============================================================================
// RESOLUTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAccount {
    pub account: Account,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// None when a human has to pick from `suggestions`
    pub account: Option<Account>,

    /// Ranked, highest confidence first
    pub suggestions: Vec<ScoredAccount>,

    pub reason: String,

    /// Learned pattern that produced the match, if any
    pub pattern_id: Option<Uuid>,
}

impl Resolution {
    fn unresolved(suggestions: Vec<ScoredAccount>, reason: String) -> Self {
        Resolution {
            account: None,
            suggestions,
            reason,
            pattern_id: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.account.is_some()
    }
}

// ============================================================================
// MATCHER
// ============================================================================

pub struct AccountPatternMatcher {
    accounts: AccountRegistry,
    patterns: PatternRegistry,

    /// Last-4-digits match confidence (default: 0.9)
    pub last_digits_confidence: f64,

    /// Wallet name substring confidence (default: 0.8)
    pub wallet_confidence: f64,

    /// Institution name substring confidence (default: 0.7)
    pub institution_confidence: f64,

    /// A single heuristic suggestion at or above this resolves automatically (default: 0.9)
    pub auto_resolve_confidence: f64,
}

impl AccountPatternMatcher {
    pub fn new(accounts: AccountRegistry, patterns: PatternRegistry) -> Self {
        AccountPatternMatcher {
            accounts,
            patterns,
            last_digits_confidence: 0.9,
            wallet_confidence: 0.8,
            institution_confidence: 0.7,
            auto_resolve_confidence: 0.9,
        }
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn patterns(&self) -> &PatternRegistry {
        &self.patterns
    }

    pub fn resolve(&self, hint: &AccountHint) -> Resolution {
        if hint.is_empty() {
            return Resolution::unresolved(Vec::new(), "no account signals".to_string());
        }

        if let Some(resolution) = self.resolve_by_pattern(hint) {
            return resolution;
        }

        self.resolve_by_heuristics(hint)
    }

    pub fn resolve_record(&self, record: &CandidateRecord) -> Resolution {
        self.resolve(&Self::hint_of(record))
    }

    fn resolve_by_pattern(&self, hint: &AccountHint) -> Option<Resolution> {
        let (pattern, account) = self
            .patterns
            .matching(hint)
            .into_iter()
            .filter(|p| p.matches_identifier(hint) || !self.digits_point_elsewhere(hint, &p.account_ref))
            .filter_map(|p| {
                let account = self.accounts.find_by_id(&p.account_ref)?;
                Some((p, account))
            })
            .max_by(|(a, _), (b, _)| {
                a.confidence_score
                    .total_cmp(&b.confidence_score)
                    .then(a.usage_count.cmp(&b.usage_count))
            })?;

        let used = self.patterns.update(pattern.id, |p| p.record_use())?;
        debug!(pattern = %used.id, account = %account.id, usage = used.usage_count, "learned pattern matched");

        let reason = format!(
            "learned pattern (confidence {:.2}, used {} times)",
            used.confidence_score, used.usage_count
        );

        Some(Resolution {
            suggestions: vec![ScoredAccount {
                account: account.clone(),
                confidence: used.confidence_score,
                reason: reason.clone(),
            }],
            account: Some(account),
            reason,
            pattern_id: Some(used.id),
        })
    }

    /// The hint's card digits belong to known accounts, none of them `account_id`.
    fn digits_point_elsewhere(&self, hint: &AccountHint, account_id: &str) -> bool {
        let Some(digits) = hint.last_digits() else {
            return false;
        };
        let owners = self.accounts.find_by_last_digits(digits);
        !owners.is_empty() && owners.iter().all(|a| a.id != account_id)
    }

    fn resolve_by_heuristics(&self, hint: &AccountHint) -> Resolution {
        let mut suggestions: Vec<ScoredAccount> = Vec::new();

        if let Some(digits) = hint.last_digits() {
            for account in self.accounts.find_by_last_digits(digits) {
                suggest(&mut suggestions, account, self.last_digits_confidence, "last 4 digits match");
            }
        }
        if let Some(wallet) = hint.wallet_name() {
            for account in self.accounts.find_by_wallet(wallet) {
                suggest(&mut suggestions, account, self.wallet_confidence, "wallet name match");
            }
        }
        if let Some(institution) = hint.institution_name() {
            for account in self.accounts.find_by_institution(institution) {
                suggest(&mut suggestions, account, self.institution_confidence, "institution name match");
            }
        }

        suggestions.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.account.name.cmp(&b.account.name))
        });

        let confident: Vec<&ScoredAccount> = suggestions
            .iter()
            .filter(|s| s.confidence >= self.auto_resolve_confidence)
            .collect();

        if let [only] = confident.as_slice() {
            let account = only.account.clone();
            let reason = only.reason.clone();
            return Resolution {
                account: Some(account),
                suggestions,
                reason,
                pattern_id: None,
            };
        }

        let reason = match suggestions.len() {
            0 => "no account matched".to_string(),
            n => format!("{} candidate account(s), needs review", n),
        };
        Resolution::unresolved(suggestions, reason)
    }

    // ========================================================================
    // LEARNING
    // ========================================================================

    /// A human confirmed (or corrected) that `hint` belongs to `account_id`.
    ///
    /// Returns the created/updated pattern, or None when the hint carries no
    /// signal to learn from.
    pub fn learn(&self, hint: &AccountHint, account_id: &str) -> Result<Option<LearnedAccountPattern>> {
        if self.accounts.find_by_id(account_id).is_none() {
            return Err(UnifyError::not_found(format!("account {}", account_id)));
        }

        let Some(signal) = PatternSignal::most_specific(hint) else {
            return Ok(None);
        };

        let learned = match self.patterns.find_by_signal(&signal) {
            Some(existing) if existing.account_ref == account_id => {
                self.patterns.update(existing.id, |p| {
                    p.reinforce();
                    p.absorb_signals(hint);
                })
            }
            Some(existing) => {
                info!(
                    pattern = %existing.id,
                    from = %existing.account_ref,
                    to = %account_id,
                    signal = signal.label(),
                    "pattern corrected"
                );
                self.patterns.update(existing.id, |p| {
                    p.rebind(account_id);
                    p.absorb_signals(hint);
                })
            }
            None => {
                let pattern = LearnedAccountPattern::from_hint(account_id, hint);
                self.patterns.upsert(pattern.clone());
                Some(pattern)
            }
        };

        if let Some(pattern) = &learned {
            debug!(
                pattern = %pattern.id,
                account = %account_id,
                confidence = pattern.confidence_score,
                usage = pattern.usage_count,
                "pattern learned"
            );
        }
        Ok(learned)
    }

    pub fn learn_from_record(
        &self,
        record: &CandidateRecord,
        account_id: &str,
    ) -> Result<Option<LearnedAccountPattern>> {
        self.learn(&Self::hint_of(record), account_id)
    }

    /// Delete a learned pattern. Explicit user action only.
    pub fn forget(&self, pattern_id: Uuid) -> bool {
        let removed = self.patterns.remove(pattern_id).is_some();
        if removed {
            info!(pattern = %pattern_id, "pattern forgotten");
        }
        removed
    }

    /// The record's hint, with its merchant as a fallback merchant signal.
    fn hint_of(record: &CandidateRecord) -> AccountHint {
        let mut hint = record.account_hint.clone().unwrap_or_default();
        if hint.merchant_name().is_none() {
            hint.merchant_name = record.merchant_name().map(str::to_string);
        }
        hint
    }
}

/// Keep the highest confidence per account.
fn suggest(suggestions: &mut Vec<ScoredAccount>, account: Account, confidence: f64, reason: &str) {
    match suggestions.iter_mut().find(|s| s.account.id == account.id) {
        Some(existing) if existing.confidence >= confidence => {}
        Some(existing) => {
            existing.confidence = confidence;
            existing.reason = reason.to_string();
        }
        None => suggestions.push(ScoredAccount {
            account,
            confidence,
            reason: reason.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::AccountType;

    struct Fixture {
        matcher: AccountPatternMatcher,
        hdfc_credit: Account,
        hdfc_savings: Account,
        paytm: Account,
    }

    fn fixture() -> Fixture {
        let hdfc_credit = Account::new("HDFC Credit", AccountType::Credit, "INR")
            .with_institution("HDFC Bank")
            .with_last_digits("4242");
        let hdfc_savings = Account::new("HDFC Savings", AccountType::Savings, "INR")
            .with_institution("HDFC Bank")
            .with_last_digits("7001");
        let paytm = Account::new("Paytm", AccountType::Wallet, "INR").with_wallet("Paytm Wallet");

        let accounts = AccountRegistry::from_accounts(vec![
            hdfc_credit.clone(),
            hdfc_savings.clone(),
            paytm.clone(),
        ]);

        Fixture {
            matcher: AccountPatternMatcher::new(accounts, PatternRegistry::new()),
            hdfc_credit,
            hdfc_savings,
            paytm,
        }
    }

    #[test]
    fn test_empty_hint_returns_nothing() {
        let f = fixture();
        let resolution = f.matcher.resolve(&AccountHint::default());
        assert!(resolution.account.is_none());
        assert!(resolution.suggestions.is_empty());

        let blank = AccountHint {
            upi_id: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(f.matcher.resolve(&blank).suggestions.is_empty());
    }

    #[test]
    fn test_unique_last_digits_auto_resolves() {
        let f = fixture();
        let hint = AccountHint {
            last_digits: Some("XXXX4242".to_string()),
            institution_name: Some("HDFC".to_string()),
            ..Default::default()
        };
        let resolution = f.matcher.resolve(&hint);

        assert_eq!(resolution.account.as_ref().map(|a| &a.id), Some(&f.hdfc_credit.id));
        // Savings still listed through the institution match
        assert_eq!(resolution.suggestions.len(), 2);
        assert_eq!(resolution.suggestions[0].confidence, 0.9);
        assert_eq!(resolution.suggestions[1].account.id, f.hdfc_savings.id);
        assert_eq!(resolution.suggestions[1].confidence, 0.7);
    }

    #[test]
    fn test_ambiguous_institution_needs_review() {
        let f = fixture();
        let hint = AccountHint {
            institution_name: Some("hdfc bank".to_string()),
            ..Default::default()
        };
        let resolution = f.matcher.resolve(&hint);
        assert!(!resolution.is_resolved());
        assert_eq!(resolution.suggestions.len(), 2);
        assert!(resolution.suggestions.iter().all(|s| s.confidence == 0.7));
    }

    #[test]
    fn test_wallet_suggestion_is_not_auto_resolved() {
        let f = fixture();
        let hint = AccountHint {
            wallet_name: Some("paytm".to_string()),
            ..Default::default()
        };
        let resolution = f.matcher.resolve(&hint);
        assert!(!resolution.is_resolved());
        assert_eq!(resolution.suggestions.len(), 1);
        assert_eq!(resolution.suggestions[0].account.id, f.paytm.id);
        assert_eq!(resolution.suggestions[0].confidence, 0.8);
    }

    #[test]
    fn test_learned_pattern_reinforcement() {
        let f = fixture();
        let hint = AccountHint {
            upi_id: Some("alice@okhdfcbank".to_string()),
            ..Default::default()
        };

        let created = f.matcher.learn(&hint, &f.hdfc_savings.id).unwrap().unwrap();
        assert_eq!(created.usage_count, 1);
        assert_eq!(created.confidence_score, 0.80);

        for _ in 0..3 {
            f.matcher.learn(&hint, &f.hdfc_savings.id).unwrap();
        }

        let pattern = f.matcher.patterns().get(created.id).unwrap();
        assert_eq!(pattern.usage_count, 4);
        assert_eq!(pattern.confidence_score, 0.95);
        assert_eq!(f.matcher.patterns().count(), 1);
    }

    #[test]
    fn test_learned_pattern_wins_over_heuristics() {
        let f = fixture();
        // Digits alone would auto-resolve to the credit card
        let hint = AccountHint {
            last_digits: Some("4242".to_string()),
            sender_domain: Some("alerts.hdfcbank.net".to_string()),
            ..Default::default()
        };
        let learned = f.matcher.learn(&hint, &f.hdfc_savings.id).unwrap().unwrap();

        let resolution = f.matcher.resolve(&hint);
        assert_eq!(resolution.account.map(|a| a.id), Some(f.hdfc_savings.id.clone()));
        assert_eq!(resolution.pattern_id, Some(learned.id));

        // Selection bumps usage, not confidence
        let used = f.matcher.patterns().get(learned.id).unwrap();
        assert_eq!(used.usage_count, 2);
        assert_eq!(used.confidence_score, 0.80);
    }

    #[test]
    fn test_merchant_pattern_yields_to_conflicting_digits() {
        let f = fixture();
        let amazon = AccountHint {
            merchant_name: Some("Amazon".to_string()),
            ..Default::default()
        };
        let learned = f.matcher.learn(&amazon, &f.hdfc_credit.id).unwrap().unwrap();

        // Merchant alone still resolves through the pattern
        assert_eq!(f.matcher.resolve(&amazon).pattern_id, Some(learned.id));

        // Card digits name the savings account: the heuristics decide
        let on_savings = AccountHint {
            merchant_name: Some("Amazon".to_string()),
            last_digits: Some("7001".to_string()),
            ..Default::default()
        };
        let resolution = f.matcher.resolve(&on_savings);
        assert_eq!(resolution.pattern_id, None);
        assert_eq!(resolution.account.map(|a| a.id), Some(f.hdfc_savings.id.clone()));
    }

    #[test]
    fn test_correction_rebinds_pattern() {
        let f = fixture();
        let hint = AccountHint {
            last_digits: Some("4242".to_string()),
            ..Default::default()
        };
        let first = f.matcher.learn(&hint, &f.hdfc_credit.id).unwrap().unwrap();
        f.matcher.learn(&hint, &f.hdfc_credit.id).unwrap();

        let corrected = f.matcher.learn(&hint, &f.paytm.id).unwrap().unwrap();
        assert_eq!(corrected.id, first.id);
        assert_eq!(corrected.account_ref, f.paytm.id);
        assert_eq!(corrected.usage_count, 1);
        assert_eq!(corrected.confidence_score, 0.80);
    }

    #[test]
    fn test_learn_requires_known_account_and_signal() {
        let f = fixture();
        let hint = AccountHint {
            upi_id: Some("bob@ybl".to_string()),
            ..Default::default()
        };
        assert!(f.matcher.learn(&hint, "no-such-account").is_err());
        assert_eq!(f.matcher.learn(&AccountHint::default(), &f.paytm.id).unwrap(), None);
    }

    #[test]
    fn test_forget_pattern() {
        let f = fixture();
        let hint = AccountHint {
            upi_id: Some("bob@ybl".to_string()),
            ..Default::default()
        };
        let pattern = f.matcher.learn(&hint, &f.paytm.id).unwrap().unwrap();

        assert!(f.matcher.forget(pattern.id));
        assert!(!f.matcher.forget(pattern.id));
        assert!(!f.matcher.resolve(&hint).is_resolved());
    }

    #[test]
    fn test_record_merchant_feeds_hint() {
        use crate::record::{Direction, SourceKind};
        use chrono::NaiveDate;
        use rust_decimal_macros::dec;

        let f = fixture();
        let record = CandidateRecord::new(
            dec!(120.00),
            "INR",
            Direction::Debit,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            SourceKind::Email,
            "m-9",
        )
        .with_merchant("Blue Tokai");

        let learned = f.matcher.learn_from_record(&record, &f.paytm.id).unwrap().unwrap();
        assert_eq!(learned.merchant_name.as_deref(), Some("Blue Tokai"));

        let resolution = f.matcher.resolve_record(&record);
        assert_eq!(resolution.account.map(|a| a.id), Some(f.paytm.id.clone()));
    }
}
