// 🧠 Learned Account Pattern - weak signal → account mappings learned from humans
//
// Every time a human confirms or corrects an account assignment the matcher
// records which signals (UPI id, card digits, sender domain...) pointed at
// which account. Patterns are only ever removed by an explicit user action.

use crate::entities::account::Account;
use crate::record::AccountHint;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Confidence of a freshly learned (or corrected) pattern
pub const INITIAL_CONFIDENCE: f64 = 0.80;

/// Confidence gained per confirmation, capped at 1.0
pub const REINFORCEMENT_STEP: f64 = 0.05;

// ============================================================================
// PATTERN SIGNAL
// ============================================================================

/// One signal used to identify an existing pattern when learning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSignal {
    UpiId(String),
    LastDigits(String),
    SenderDomain(String),
    WalletName(String),
    InstitutionName(String),
    MerchantName(String),
}

impl PatternSignal {
    /// Most specific signal in the hint: UPI id > last digits > sender domain,
    /// then wallet > institution > merchant.
    pub fn most_specific(hint: &AccountHint) -> Option<Self> {
        if let Some(upi) = hint.upi_id() {
            return Some(PatternSignal::UpiId(upi.to_lowercase()));
        }
        if let Some(digits) = hint.last_digits() {
            let digits = Account::last_four(digits);
            if !digits.is_empty() {
                return Some(PatternSignal::LastDigits(digits));
            }
        }
        if let Some(domain) = hint.sender_domain() {
            return Some(PatternSignal::SenderDomain(domain.to_lowercase()));
        }
        if let Some(wallet) = hint.wallet_name() {
            return Some(PatternSignal::WalletName(wallet.to_lowercase()));
        }
        if let Some(institution) = hint.institution_name() {
            return Some(PatternSignal::InstitutionName(institution.to_lowercase()));
        }
        hint.merchant_name()
            .map(|merchant| PatternSignal::MerchantName(merchant.to_lowercase()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            PatternSignal::UpiId(_) => "upi_id",
            PatternSignal::LastDigits(_) => "last_digits",
            PatternSignal::SenderDomain(_) => "sender_domain",
            PatternSignal::WalletName(_) => "wallet_name",
            PatternSignal::InstitutionName(_) => "institution_name",
            PatternSignal::MerchantName(_) => "merchant_name",
        }
    }
}

// ============================================================================
// LEARNED ACCOUNT PATTERN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedAccountPattern {
    pub id: Uuid,

    /// Account the signals point at
    pub account_ref: String,

    pub sender_domain: Option<String>,
    pub last_digits: Option<String>,
    pub upi_id: Option<String>,
    pub institution_name: Option<String>,
    pub merchant_name: Option<String>,
    pub wallet_name: Option<String>,

    pub confidence_score: f64,
    pub usage_count: u32,

    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl LearnedAccountPattern {
    /// New pattern capturing every signal present in the hint.
    pub fn from_hint(account_ref: &str, hint: &AccountHint) -> Self {
        let now = Utc::now();
        let mut pattern = LearnedAccountPattern {
            id: Uuid::new_v4(),
            account_ref: account_ref.to_string(),
            sender_domain: None,
            last_digits: None,
            upi_id: None,
            institution_name: None,
            merchant_name: None,
            wallet_name: None,
            confidence_score: INITIAL_CONFIDENCE,
            usage_count: 1,
            created_at: now,
            last_used_at: now,
        };
        pattern.absorb_signals(hint);
        pattern
    }

    /// Fill in signals this pattern does not know yet.
    pub fn absorb_signals(&mut self, hint: &AccountHint) {
        fill(&mut self.sender_domain, hint.sender_domain());
        fill(&mut self.last_digits, hint.last_digits().map(Account::last_four).as_deref());
        fill(&mut self.upi_id, hint.upi_id());
        fill(&mut self.institution_name, hint.institution_name());
        fill(&mut self.merchant_name, hint.merchant_name());
        fill(&mut self.wallet_name, hint.wallet_name());
    }

    /// Any signal of the hint matches: exact for domain/digits/UPI,
    /// substring (either way, case-insensitive) for names. Never matches a
    /// hint that names a different UPI handle or card than this pattern.
    pub fn matches(&self, hint: &AccountHint) -> bool {
        if self.contradicts(hint) {
            return false;
        }

        self.matches_identifier(hint)
            || equal_ci(&self.sender_domain, hint.sender_domain())
            || overlaps_ci(&self.institution_name, hint.institution_name())
            || overlaps_ci(&self.merchant_name, hint.merchant_name())
            || overlaps_ci(&self.wallet_name, hint.wallet_name())
    }

    /// Matches on an account identifier (UPI handle or card digits).
    pub fn matches_identifier(&self, hint: &AccountHint) -> bool {
        equal_ci(&self.upi_id, hint.upi_id())
            || matches!(
                digits_pair(&self.last_digits, hint.last_digits()),
                Some((ours, theirs)) if ours == theirs
            )
    }

    /// Both sides carry an identifier and they disagree.
    pub fn contradicts(&self, hint: &AccountHint) -> bool {
        let upi_differs = match (self.upi_id.as_deref(), hint.upi_id()) {
            (Some(ours), Some(theirs)) => !ours.trim().eq_ignore_ascii_case(theirs.trim()),
            _ => false,
        };
        upi_differs
            || matches!(
                digits_pair(&self.last_digits, hint.last_digits()),
                Some((ours, theirs)) if ours != theirs
            )
    }

    /// Carries exactly this signal value.
    pub fn has_signal(&self, signal: &PatternSignal) -> bool {
        let (field, value) = match signal {
            PatternSignal::UpiId(v) => (&self.upi_id, v),
            PatternSignal::LastDigits(v) => (&self.last_digits, v),
            PatternSignal::SenderDomain(v) => (&self.sender_domain, v),
            PatternSignal::WalletName(v) => (&self.wallet_name, v),
            PatternSignal::InstitutionName(v) => (&self.institution_name, v),
            PatternSignal::MerchantName(v) => (&self.merchant_name, v),
        };
        field
            .as_deref()
            .map(|f| f.trim().to_lowercase() == *value)
            .unwrap_or(false)
    }

    /// Selected by resolve(): usage only.
    pub fn record_use(&mut self) {
        self.usage_count += 1;
        self.last_used_at = Utc::now();
    }

    /// Confirmed by a human: usage and confidence.
    pub fn reinforce(&mut self) {
        self.record_use();
        let raised = ((self.confidence_score + REINFORCEMENT_STEP) * 100.0).round() / 100.0;
        self.confidence_score = raised.min(1.0);
    }

    /// Corrected by a human: point at another account and start over.
    pub fn rebind(&mut self, account_ref: &str) {
        self.account_ref = account_ref.to_string();
        self.confidence_score = INITIAL_CONFIDENCE;
        self.usage_count = 1;
        self.last_used_at = Utc::now();
    }
}

fn fill(field: &mut Option<String>, value: Option<&str>) {
    if field.is_none() {
        *field = value.map(|v| v.trim().to_string());
    }
}

/// Stored digits and the hint's last four, when both are present.
fn digits_pair<'a>(field: &'a Option<String>, value: Option<&str>) -> Option<(&'a str, String)> {
    let ours = field.as_deref()?;
    let theirs = Account::last_four(value?);
    if theirs.is_empty() {
        return None;
    }
    Some((ours, theirs))
}

fn equal_ci(field: &Option<String>, value: Option<&str>) -> bool {
    match (field.as_deref(), value) {
        (Some(ours), Some(theirs)) => ours.trim().eq_ignore_ascii_case(theirs.trim()),
        _ => false,
    }
}

fn overlaps_ci(field: &Option<String>, value: Option<&str>) -> bool {
    match (field.as_deref(), value) {
        (Some(ours), Some(theirs)) => {
            let ours = ours.trim().to_lowercase();
            let theirs = theirs.trim().to_lowercase();
            !ours.is_empty() && !theirs.is_empty() && (ours.contains(&theirs) || theirs.contains(&ours))
        }
        _ => false,
    }
}

// ============================================================================
// PATTERN REGISTRY
// ============================================================================

#[derive(Clone)]
pub struct PatternRegistry {
    patterns: Arc<RwLock<Vec<LearnedAccountPattern>>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        PatternRegistry {
            patterns: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn from_patterns(patterns: Vec<LearnedAccountPattern>) -> Self {
        PatternRegistry {
            patterns: Arc::new(RwLock::new(patterns)),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<LearnedAccountPattern> {
        self.patterns.read().iter().find(|p| p.id == id).cloned()
    }

    /// Patterns with at least one signal matching the hint
    pub fn matching(&self, hint: &AccountHint) -> Vec<LearnedAccountPattern> {
        self.patterns
            .read()
            .iter()
            .filter(|p| p.matches(hint))
            .cloned()
            .collect()
    }

    pub fn find_by_signal(&self, signal: &PatternSignal) -> Option<LearnedAccountPattern> {
        self.patterns
            .read()
            .iter()
            .find(|p| p.has_signal(signal))
            .cloned()
    }

    /// Insert or replace by id
    pub fn upsert(&self, pattern: LearnedAccountPattern) {
        let mut patterns = self.patterns.write();
        match patterns.iter_mut().find(|p| p.id == pattern.id) {
            Some(existing) => *existing = pattern,
            None => patterns.push(pattern),
        }
    }

    /// Apply `update` to the pattern in place; None when it no longer exists.
    pub fn update<F>(&self, id: Uuid, update: F) -> Option<LearnedAccountPattern>
    where
        F: FnOnce(&mut LearnedAccountPattern),
    {
        let mut patterns = self.patterns.write();
        let pattern = patterns.iter_mut().find(|p| p.id == id)?;
        update(pattern);
        Some(pattern.clone())
    }

    pub fn remove(&self, id: Uuid) -> Option<LearnedAccountPattern> {
        let mut patterns = self.patterns.write();
        let index = patterns.iter().position(|p| p.id == id)?;
        Some(patterns.remove(index))
    }

    pub fn all(&self) -> Vec<LearnedAccountPattern> {
        self.patterns.read().clone()
    }

    pub fn count(&self) -> usize {
        self.patterns.read().len()
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}
