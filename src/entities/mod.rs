// Entity Models
// "Identity persists, values change"
//
// Each entity has a stable UUID identity and a registry for lookups.

pub mod account;
pub mod pattern;

pub use account::{Account, AccountRegistry, AccountType};
pub use pattern::{LearnedAccountPattern, PatternRegistry, PatternSignal};
