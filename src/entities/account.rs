// 💳 Account Entity - the accounts a transaction can be assigned to
//
// "Account name is a VALUE (can change), Account UUID is IDENTITY (never changes)"
//
// The matcher only ever looks at the weak signals an account exposes:
// last digits of the card/account number, institution name, wallet name.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// ACCOUNT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    /// Checking / current account (debit card, daily transactions)
    Checking,

    /// Savings account
    Savings,

    /// Credit card
    Credit,

    /// Prepaid wallet (Paytm, PhonePe, Apple Cash...)
    Wallet,

    /// Other / Unknown
    Other,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "Checking",
            AccountType::Savings => "Savings",
            AccountType::Credit => "Credit",
            AccountType::Wallet => "Wallet",
            AccountType::Other => "Other",
        }
    }

    /// Unknown labels map to Other.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "checking" => AccountType::Checking,
            "savings" => AccountType::Savings,
            "credit" => AccountType::Credit,
            "wallet" => AccountType::Wallet,
            _ => AccountType::Other,
        }
    }
}

// ============================================================================
// ACCOUNT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identity (UUID) - NEVER changes
    pub id: String,

    /// Display name (e.g., "HDFC Credit *4242")
    pub name: String,

    pub account_type: AccountType,

    /// Issuing bank / institution (e.g., "HDFC Bank")
    pub institution_name: Option<String>,

    /// Last 4 digits of the card or account number
    pub last_digits: Option<String>,

    /// Wallet provider name for wallet accounts
    pub wallet_name: Option<String>,

    /// Currency (ISO 4217 code)
    pub currency: String,
}

impl Account {
    /// Create new account entity with UUID
    pub fn new(name: &str, account_type: AccountType, currency: &str) -> Self {
        Account {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            account_type,
            institution_name: None,
            last_digits: None,
            wallet_name: None,
            currency: currency.to_string(),
        }
    }

    pub fn with_institution(mut self, institution: &str) -> Self {
        self.institution_name = Some(institution.to_string());
        self
    }

    /// Accepts a full or masked number; only the last 4 digits are kept.
    pub fn with_last_digits(mut self, number: &str) -> Self {
        self.last_digits = Some(Self::last_four(number));
        self
    }

    pub fn with_wallet(mut self, wallet: &str) -> Self {
        self.wallet_name = Some(wallet.to_string());
        self
    }

    /// Last 4 digits of a card/account number
    ///
    /// Example: "XXXX-XXXX-1234" → "1234"
    pub fn last_four(number: &str) -> String {
        let digits: Vec<char> = number.chars().filter(|c| c.is_ascii_digit()).collect();
        let start = digits.len().saturating_sub(4);
        digits[start..].iter().collect()
    }
}

// ============================================================================
// ACCOUNT REGISTRY
// ============================================================================

/// Registry of all known accounts, shared between the matcher and the CLI.
#[derive(Clone)]
pub struct AccountRegistry {
    accounts: Arc<RwLock<Vec<Account>>>,
}

impl AccountRegistry {
    /// Create new empty registry
    pub fn new() -> Self {
        AccountRegistry {
            accounts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        AccountRegistry {
            accounts: Arc::new(RwLock::new(accounts)),
        }
    }

    /// Register an account (replaces an existing one with the same id)
    pub fn register(&self, account: Account) {
        let mut accounts = self.accounts.write();
        accounts.retain(|a| a.id != account.id);
        accounts.push(account);
    }

    /// Find account by UUID
    pub fn find_by_id(&self, id: &str) -> Option<Account> {
        self.accounts.read().iter().find(|a| a.id == id).cloned()
    }

    /// Accounts whose last 4 digits equal `digits` exactly
    pub fn find_by_last_digits(&self, digits: &str) -> Vec<Account> {
        let wanted = Account::last_four(digits);
        if wanted.is_empty() {
            return Vec::new();
        }
        self.accounts
            .read()
            .iter()
            .filter(|a| a.last_digits.as_deref() == Some(wanted.as_str()))
            .cloned()
            .collect()
    }

    /// Accounts whose institution name contains `name` (case-insensitive)
    pub fn find_by_institution(&self, name: &str) -> Vec<Account> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.accounts
            .read()
            .iter()
            .filter(|a| {
                a.institution_name
                    .as_deref()
                    .map(|i| i.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Accounts whose wallet name contains `name` (case-insensitive)
    pub fn find_by_wallet(&self, name: &str) -> Vec<Account> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.accounts
            .read()
            .iter()
            .filter(|a| {
                a.wallet_name
                    .as_deref()
                    .map(|w| w.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// All accounts, sorted by name
    pub fn all_accounts(&self) -> Vec<Account> {
        let mut all = self.accounts.read().clone();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn count(&self) -> usize {
        self.accounts.read().len()
    }
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AccountRegistry {
        let registry = AccountRegistry::new();
        registry.register(
            Account::new("HDFC Credit", AccountType::Credit, "INR")
                .with_institution("HDFC Bank")
                .with_last_digits("XXXX-XXXX-XXXX-4242"),
        );
        registry.register(
            Account::new("ICICI Savings", AccountType::Savings, "INR")
                .with_institution("ICICI Bank")
                .with_last_digits("9001"),
        );
        registry.register(Account::new("Paytm", AccountType::Wallet, "INR").with_wallet("Paytm Wallet"));
        registry
    }

    #[test]
    fn test_last_four() {
        assert_eq!(Account::last_four("1234567890"), "7890");
        assert_eq!(Account::last_four("*1234"), "1234");
        assert_eq!(Account::last_four("12"), "12");
        assert_eq!(Account::last_four("no digits"), "");
    }

    #[test]
    fn test_lookups() {
        let registry = registry();
        assert_eq!(registry.count(), 3);

        let by_digits = registry.find_by_last_digits("4242");
        assert_eq!(by_digits.len(), 1);
        assert_eq!(by_digits[0].name, "HDFC Credit");

        assert_eq!(registry.find_by_institution("hdfc").len(), 1);
        assert_eq!(registry.find_by_institution("bank").len(), 2);
        assert_eq!(registry.find_by_wallet("paytm").len(), 1);
        assert!(registry.find_by_wallet("").is_empty());
        assert!(registry.find_by_last_digits("0000").is_empty());
    }

    #[test]
    fn test_register_replaces_same_id() {
        let registry = registry();
        let mut account = registry.find_by_last_digits("9001").remove(0);
        account.name = "ICICI Salary".to_string();
        registry.register(account.clone());

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.find_by_id(&account.id).unwrap().name, "ICICI Salary");
    }

    #[test]
    fn test_account_type_labels() {
        assert_eq!(AccountType::from_str_lossy("wallet"), AccountType::Wallet);
        assert_eq!(AccountType::from_str_lossy("Credit"), AccountType::Credit);
        assert_eq!(AccountType::from_str_lossy("brokerage"), AccountType::Other);
        assert_eq!(AccountType::Savings.as_str(), "Savings");
    }
}
