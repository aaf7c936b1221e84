//! Binary entry point for identity-dedup.
//!
//! Runs the deduplication daemons, or one of their passes, and exposes the
//! suspicion operations an operator needs.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// CLI output goes to stdout, errors to stderr
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use identity_dedup::config::DedupConfig;
use identity_dedup::daemon::DaemonRunner;
use identity_dedup::models::{ActionType, AuthorType, CustomerId, RequestAuthor, SuspicionId};
use identity_dedup::observability;
use identity_dedup::services::DedupServices;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

/// identity-dedup - duplicate detection and resolution for identity records.
#[derive(Parser)]
#[command(name = "identity-dedup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, env = "IDENTITY_DEDUP_CONFIG")]
    config: Option<PathBuf>,

    /// Operator name recorded on manual operations.
    #[arg(long, global = true, default_value = "operator")]
    operator: String,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the three daemons until interrupted.
    Run,

    /// Run one detection scan.
    Scan,

    /// Process one batch of queued actions.
    Reconcile,

    /// Run one automatic resolution pass.
    Resolve,

    /// Queue an identity change for reconciliation.
    Enqueue {
        /// Changed identity.
        customer_id: String,

        /// Kind of change: create, update, delete, merge, merge-cancelled.
        #[arg(short = 't', long, default_value = "update")]
        action_type: String,

        /// Date of the change (RFC 3339), now by default.
        #[arg(long)]
        date: Option<DateTime<Utc>>,
    },

    /// List the suspicions of a rule.
    Suspicions {
        /// Rule code.
        rule: String,

        /// Zero-based page.
        #[arg(short, long, default_value = "0")]
        page: usize,

        /// Page size.
        #[arg(short, long, default_value = "20")]
        size: usize,
    },

    /// List the detection rules.
    Rules,

    /// Lock a suspicion for the operator.
    Lock {
        /// Suspicion id.
        id: String,
    },

    /// Release a suspicion held by the operator.
    Unlock {
        /// Suspicion id.
        id: String,
    },

    /// Declare two identities as distinct.
    Exclude {
        /// First identity.
        first: String,
        /// Second identity.
        second: String,
    },

    /// Withdraw an exclusion.
    CancelExclusion {
        /// First identity.
        first: String,
        /// Second identity.
        second: String,
    },
}

fn main() -> ExitCode {
    // A missing .env file is not an error.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    let _observability = match observability::init(&config.logging, &config.metrics) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<DedupConfig> {
    let config = match path {
        Some(path) => DedupConfig::load_from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => DedupConfig::load_default(),
    };
    Ok(config.with_env_overrides())
}

fn run_command(cli: Cli, config: &DedupConfig) -> Result<()> {
    let services = DedupServices::from_config(config).context("initializing services")?;
    let operator = RequestAuthor::new(cli.operator, AuthorType::Agent);

    match cli.command {
        Commands::Run => cmd_run(&services, config),
        Commands::Scan => {
            println!("{}", services.scanner().run()?.summary());
            Ok(())
        },
        Commands::Reconcile => {
            println!("{}", services.reconciler().run()?.summary());
            Ok(())
        },
        Commands::Resolve => {
            println!("{}", services.resolver().run()?.summary());
            Ok(())
        },
        Commands::Enqueue {
            customer_id,
            action_type,
            date,
        } => {
            let action = services.queue().enqueue(
                &CustomerId::new(customer_id),
                ActionType::parse(&action_type)?,
                date.unwrap_or_else(Utc::now),
            )?;
            println!(
                "Queued {} for {} (#{})",
                action.action_type.as_str(),
                action.customer_id,
                action.id
            );
            Ok(())
        },
        Commands::Suspicions { rule, page, size } => cmd_suspicions(&services, &rule, page, size),
        Commands::Rules => cmd_rules(&services),
        Commands::Lock { id } => {
            services.suspicions().lock(&SuspicionId::new(id.clone()), &operator)?;
            println!("Locked {id}");
            Ok(())
        },
        Commands::Unlock { id } => {
            services
                .suspicions()
                .unlock(&SuspicionId::new(id.clone()), &operator)?;
            println!("Unlocked {id}");
            Ok(())
        },
        Commands::Exclude { first, second } => {
            let removed = services.suspicions().exclude(
                &CustomerId::new(first.clone()),
                &CustomerId::new(second.clone()),
                &operator,
                &BTreeMap::new(),
            )?;
            println!("Excluded {first} / {second} ({removed} suspicions removed)");
            Ok(())
        },
        Commands::CancelExclusion { first, second } => {
            services.suspicions().cancel_exclusion(
                &CustomerId::new(first.clone()),
                &CustomerId::new(second.clone()),
                &operator,
                &BTreeMap::new(),
            )?;
            println!("Exclusion {first} / {second} cancelled");
            Ok(())
        },
    }
}

fn cmd_run(services: &DedupServices, config: &DedupConfig) -> Result<()> {
    let mut runner = DaemonRunner::new();
    let shutdown = runner.shutdown_flag();
    ctrlc::set_handler(move || {
        tracing::info!("Received shutdown signal, finishing current runs");
        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    services.spawn_daemons(&mut runner, config)?;
    println!("Daemons running (Ctrl+C to stop)");
    runner.join();
    Ok(())
}

fn cmd_suspicions(services: &DedupServices, rule: &str, page: usize, size: usize) -> Result<()> {
    let suspicions = services.suspicions();
    let listing = suspicions.page(rule, page, size)?;
    if listing.total == 0 {
        println!("No suspicion for rule {rule}");
        return Ok(());
    }
    println!(
        "Rule {rule}: page {} ({} of {} suspicions)",
        listing.page,
        listing.items.len(),
        listing.total
    );
    for suspicion in &listing.items {
        let others: Vec<&str> = suspicion.others().map(CustomerId::as_str).collect();
        let lock = if suspicion.lock.is_active(Utc::now()) {
            format!(
                " [locked by {}]",
                suspicion.lock.author_name.as_deref().unwrap_or("?")
            )
        } else {
            String::new()
        };
        println!(
            "  {}  {} ~ {}{lock}",
            suspicion.id,
            suspicion.customer_id,
            others.join(", ")
        );
    }
    Ok(())
}

fn cmd_rules(services: &DedupServices) -> Result<()> {
    let rules = services.rules().list_rules()?;
    if rules.is_empty() {
        bail!("no rule configured; add [[rules]] to the configuration");
    }
    for rule in rules {
        let limit = if rule.is_limited() {
            format!("limit {} {}", rule.detection_limit, rule.limitation_mode.as_str())
        } else {
            "unlimited".to_string()
        };
        let last = rule
            .last_execution_date
            .map_or_else(|| "never".to_string(), |date| date.to_rfc3339());
        println!(
            "{:>3}  {:<16} [{}] {limit}, daemon={}, active={}, last run {last}",
            rule.priority,
            rule.code,
            rule.checked_attributes.join(", "),
            rule.daemon,
            rule.active
        );
    }
    Ok(())
}
