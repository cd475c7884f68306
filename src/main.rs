use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;
use trust_unify::{
    load_accounts, load_patterns, load_records, save_account, save_pattern, Account, AccountPatternMatcher,
    AccountRegistry, AccountType, MergeAction, MergeEngine, PatternRegistry, SourceKey, SourceKind, SqliteStore,
    TransactionStore, UnifyConfig,
};
use uuid::Uuid;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = UnifyConfig::load().context("Failed to load configuration")?;

    match args.get(1).map(String::as_str) {
        Some("import") if args.len() == 3 => run_import(&config, Path::new(&args[2])),
        Some("show") if args.len() == 3 => run_show(&config, &args[2]),
        Some("split") if args.len() == 4 => run_split(&config, &args[2], &args[3]),
        Some("duplicate") if args.len() == 4 => run_duplicate(&config, &args[2], &args[3]),
        Some("learn") if args.len() == 5 => run_learn(&config, &args[2], &args[3], &args[4]),
        Some("forget") if args.len() == 3 => run_forget(&config, &args[2]),
        Some("account") if args.get(2).map(String::as_str) == Some("list") => run_account_list(&config),
        Some("account") if args.len() >= 5 && args[2] == "add" => {
            run_account_add(&config, &args[3], &args[4], &args[5..])
        }
        _ => {
            print_usage();
            std::process::exit(2);
        }
    }
}

fn print_usage() {
    eprintln!("trust-unify {}", trust_unify::VERSION);
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  trust-unify import <records.json|records.jsonl|records.csv>");
    eprintln!("  trust-unify show <transaction-id>");
    eprintln!("  trust-unify split <source> <source_id>");
    eprintln!("  trust-unify duplicate <transaction-id> <superseded-by-id>");
    eprintln!("  trust-unify learn <source> <source_id> <account-id>");
    eprintln!("  trust-unify forget <pattern-id>");
    eprintln!("  trust-unify account add <name> <checking|savings|credit|wallet|other>");
    eprintln!("      [--institution <name>] [--last-digits <number>] [--wallet <name>] [--currency <code>]");
    eprintln!("  trust-unify account list");
}

fn open_store(config: &UnifyConfig) -> Result<SqliteStore> {
    let path = Path::new(&config.database.path);
    SqliteStore::open(path).with_context(|| format!("Failed to open database: {:?}", path))
}

fn open_matcher(store: &SqliteStore) -> Result<AccountPatternMatcher> {
    let accounts = load_accounts(store.connection())?;
    let patterns = load_patterns(store.connection())?;
    Ok(AccountPatternMatcher::new(
        AccountRegistry::from_accounts(accounts),
        PatternRegistry::from_patterns(patterns),
    ))
}

fn parse_key(source: &str, source_id: &str) -> Result<SourceKey> {
    let source: SourceKind = source.parse().context("Unknown source kind")?;
    Ok(SourceKey::new(source, source_id))
}

// ============================================================================
// COMMANDS
// ============================================================================

fn run_import(config: &UnifyConfig, path: &Path) -> Result<()> {
    println!("📥 Importing candidate records");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading {:?}...", path);
    let records = load_records(path)?;
    println!("✓ Loaded {} records", records.len());

    let mut store = open_store(config)?;
    let matcher = open_matcher(&store)?;
    let engine = MergeEngine::from_config(&config.matching);

    println!("\n🔗 Merging...");
    let (mut created, mut merged, mut replayed, mut rejected) = (0, 0, 0, 0);

    for (record, result) in engine.ingest_batch(&records, &mut store)? {
        let label = format!("{} {}", record.source, record.source_id);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                rejected += 1;
                println!("  ⛔ {:<28} rejected: {}", label, err);
                continue;
            }
        };

        match &outcome.decision {
            Some(decision) => {
                match decision.action {
                    MergeAction::Created => created += 1,
                    MergeAction::Merged => merged += 1,
                }
                println!(
                    "  {} {:<28} → {} (score {:.2})",
                    if decision.action == MergeAction::Merged { "🔀" } else { "🆕" },
                    label,
                    decision.unified_transaction_id,
                    decision.score
                );
            }
            None => {
                replayed += 1;
                println!("  ↩️  {:<28} → {} (already linked)", label, outcome.transaction.id);
            }
        }

        let resolution = matcher.resolve_record(record);
        if let Some(account) = &resolution.account {
            println!("       💳 {} ({})", account.name, resolution.reason);
        } else if !resolution.suggestions.is_empty() {
            println!("       ❓ {}", resolution.reason);
        }
    }

    // Pattern usage changes on resolve
    for pattern in matcher.patterns().all() {
        save_pattern(store.connection(), &pattern)?;
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Import complete");
    println!("✓ Created: {}", created);
    println!("✓ Merged: {}", merged);
    println!("✓ Already linked: {}", replayed);
    if rejected > 0 {
        println!("⚠️  Rejected: {}", rejected);
    }
    println!("✓ Ledger now holds {} transactions", store.count()?);

    Ok(())
}

fn run_show(config: &UnifyConfig, id: &str) -> Result<()> {
    let id = Uuid::parse_str(id).context("Invalid transaction id")?;
    let store = open_store(config)?;

    let Some(tx) = store.get(id)? else {
        bail!("Transaction not found: {}", id);
    };

    println!("🧾 {}", tx.id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Amount:      {} {} ({})", tx.amount, tx.currency, tx.direction.as_str());
    println!("Date:        {}", tx.transaction_date);
    println!("Merchant:    {}", tx.merchant.as_deref().unwrap_or("-"));
    if !tx.merchant_variants.is_empty() {
        let variants: Vec<&str> = tx.merchant_variants.iter().map(String::as_str).collect();
        println!("Variants:    {}", variants.join(", "));
    }
    if !tx.reference_ids.is_empty() {
        let references: Vec<&str> = tx.reference_ids.iter().map(String::as_str).collect();
        println!("References:  {}", references.join(", "));
    }
    println!("Confidence:  {:.2}", tx.merge_confidence);
    println!("Version:     {}", tx.version);
    if let Some(survivor) = tx.duplicate_of {
        println!("⚠️  Duplicate of {}", survivor);
    }

    println!("\n🔗 Sources:");
    for key in store.links_for(tx.id)? {
        println!("  • {}", key);
    }

    println!("\n📝 Merge reason:");
    for line in tx.merge_reason.lines() {
        println!("  {}", line);
    }

    println!("\n📜 Events:");
    for event in store.events_for(tx.id)? {
        println!("  {} {} by {}", event.timestamp.format("%Y-%m-%d %H:%M:%S"), event.event_type, event.actor);
    }

    Ok(())
}

fn run_split(config: &UnifyConfig, source: &str, source_id: &str) -> Result<()> {
    let key = parse_key(source, source_id)?;
    let mut store = open_store(config)?;
    let engine = MergeEngine::from_config(&config.matching);

    let split = engine.split(&mut store, &key)?;
    println!("✂️  Split {} out of {}", key, split.origin.id);
    println!("✓ New transaction: {}", split.split_off.id);
    println!("✓ {} source(s) remain on {}", split.origin.source_count(), split.origin.id);

    Ok(())
}

fn run_duplicate(config: &UnifyConfig, id: &str, superseded_by: &str) -> Result<()> {
    let id = Uuid::parse_str(id).context("Invalid transaction id")?;
    let superseded_by = Uuid::parse_str(superseded_by).context("Invalid transaction id")?;
    let mut store = open_store(config)?;
    let engine = MergeEngine::from_config(&config.matching);

    engine.mark_duplicate(&mut store, id, superseded_by)?;
    println!("🗂️  {} marked as duplicate of {}", id, superseded_by);

    Ok(())
}

fn run_learn(config: &UnifyConfig, source: &str, source_id: &str, account_id: &str) -> Result<()> {
    let key = parse_key(source, source_id)?;
    let store = open_store(config)?;
    let matcher = open_matcher(&store)?;

    let Some(record) = store.linked_record(&key)? else {
        bail!("No record linked for {}", key);
    };

    match matcher.learn_from_record(&record, account_id)? {
        Some(pattern) => {
            save_pattern(store.connection(), &pattern)?;
            println!("🧠 Learned pattern {} → {}", pattern.id, pattern.account_ref);
            println!("✓ Confidence {:.2}, used {} time(s)", pattern.confidence_score, pattern.usage_count);
        }
        None => println!("⚠️  {} carries no account signals, nothing learned", key),
    }

    Ok(())
}

fn run_forget(config: &UnifyConfig, pattern_id: &str) -> Result<()> {
    let pattern_id = Uuid::parse_str(pattern_id).context("Invalid pattern id")?;
    let store = open_store(config)?;
    let matcher = open_matcher(&store)?;

    if matcher.forget(pattern_id) && trust_unify::delete_pattern(store.connection(), pattern_id)? {
        println!("🗑️  Pattern {} forgotten", pattern_id);
    } else {
        bail!("Pattern not found: {}", pattern_id);
    }

    Ok(())
}

fn run_account_add(config: &UnifyConfig, name: &str, account_type: &str, options: &[String]) -> Result<()> {
    let account_type = AccountType::from_str_lossy(account_type);
    let mut currency = "INR".to_string();
    let mut institution = None;
    let mut last_digits = None;
    let mut wallet = None;

    let mut options = options.iter();
    while let Some(flag) = options.next() {
        let Some(value) = options.next() else {
            bail!("Missing value for {}", flag);
        };
        match flag.as_str() {
            "--institution" => institution = Some(value),
            "--last-digits" => last_digits = Some(value),
            "--wallet" => wallet = Some(value),
            "--currency" => currency = value.trim().to_uppercase(),
            other => bail!("Unknown option: {}", other),
        }
    }

    let mut account = Account::new(name, account_type, &currency);
    if let Some(institution) = institution {
        account = account.with_institution(institution);
    }
    if let Some(number) = last_digits {
        account = account.with_last_digits(number);
        if account.last_digits.as_deref() == Some("") {
            bail!("No digits in {:?}", number);
        }
    }
    if let Some(wallet) = wallet {
        account = account.with_wallet(wallet);
    }

    let store = open_store(config)?;
    save_account(store.connection(), &account)?;

    println!("💳 Added account {} ({})", account.name, account.account_type.as_str());
    println!("✓ Id: {}", account.id);

    Ok(())
}

fn run_account_list(config: &UnifyConfig) -> Result<()> {
    let store = open_store(config)?;
    let accounts = load_accounts(store.connection())?;

    println!("💳 {} account(s)", accounts.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for account in accounts {
        println!(
            "  {}  {:<24} {:<9} {} {}",
            account.id,
            account.name,
            account.account_type.as_str(),
            account.currency,
            account.last_digits.as_deref().map(|d| format!("*{}", d)).unwrap_or_default()
        );
    }

    Ok(())
}
