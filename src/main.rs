//! response-tracker: command-line front end for the engagement tracker.
//!
//! Usage:
//!     response-tracker scan --mode incremental --enrich
//!     response-tracker show --top 20
//!     response-tracker draft someone@example.com --save

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use response_tracker_lib::config::{load_config, state_dir, TrackerConfig};
use response_tracker_lib::drafts::{DraftSession, FOLLOW_UP_SUBJECT};
use response_tracker_lib::enrich::{generate_follow_up_draft, is_draft_placeholder};
use response_tracker_lib::error::{ScanError, ScanFailure};
use response_tracker_lib::google_api::gmail::GmailThreadSource;
use response_tracker_lib::google_api::token_store::peek_account_email;
use response_tracker_lib::oracle::ClaudeCliOracle;
use response_tracker_lib::scan::ScanOrchestrator;
use response_tracker_lib::store::{SqliteStateStore, StateStore, LEGACY_FILE_NAME};
use response_tracker_lib::types::{ContactAggregate, ScanMode, ScanProgress, ScanSummary};
use response_tracker_lib::views;

#[derive(Parser, Debug)]
#[command(name = "response-tracker", version, about = "Track who writes back, and who to follow up with")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the mailbox and update contact aggregates
    Scan {
        #[arg(long, value_enum, default_value_t = ModeArg::Incremental)]
        mode: ModeArg,
        /// Days to look back (custom mode only)
        #[arg(long)]
        days: Option<u32>,
        /// Classify contacts after the scan
        #[arg(long)]
        enrich: bool,
    },
    /// Contacts by received message count
    Show {
        #[arg(long)]
        top: Option<usize>,
        /// Print the raw scan state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Hot or warm contacts, or priority 7 and above
    Hot,
    /// Contacts the last enrichment recommended following up with
    FollowUps,
    /// Generate a follow-up email for one contact
    Draft {
        address: String,
        /// Save the draft to Gmail
        #[arg(long)]
        save: bool,
        /// Send the saved draft right away
        #[arg(long, requires = "save")]
        send: bool,
    },
    /// Delete all tracked state
    Reset {
        /// Skip the confirmation guard
        #[arg(long)]
        yes: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Incremental,
    Full,
    Custom,
}

fn scan_mode(mode: ModeArg, days: Option<u32>) -> anyhow::Result<ScanMode> {
    match (mode, days) {
        (ModeArg::Incremental, None) => Ok(ScanMode::Incremental),
        (ModeArg::Full, None) => Ok(ScanMode::Full),
        (ModeArg::Custom, Some(days)) => Ok(ScanMode::Custom { days }),
        (ModeArg::Custom, None) => bail!("--mode custom needs --days N"),
        (_, Some(_)) => bail!("--days only applies to --mode custom"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = load_config().map_err(|e| anyhow!("Failed to load config: {e}"))?;
    if config.mailbox_owner.is_empty() {
        match peek_account_email() {
            Some(owner) => config.mailbox_owner = owner,
            None => log::warn!(
                "No mailboxOwner configured; your own messages will be counted as contacts"
            ),
        }
    }

    let store_path = config.resolved_store_path().map_err(anyhow::Error::msg)?;
    let store = Arc::new(
        SqliteStateStore::open_at(&store_path)
            .with_context(|| format!("Failed to open {}", store_path.display()))?,
    );
    import_legacy(&store);

    match cli.command {
        Command::Scan { mode, days, enrich } => {
            let mode = scan_mode(mode, days)?;
            run_scan(store, config, mode, enrich).await
        }
        Command::Show { top, json } => {
            let state = store.load()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
                return Ok(());
            }
            println!(
                "Last scan: {}  |  Conversations scanned: {}  |  Contacts: {}",
                state
                    .last_scan_date
                    .map_or_else(|| "never".to_string(), |d| d.to_string()),
                state.total_threads_scanned,
                state.contacts.len()
            );
            print_contacts(&views::top_contacts(&state, top));
            Ok(())
        }
        Command::Hot => {
            let state = store.load()?;
            print_contacts(&views::hot_leads(&state));
            Ok(())
        }
        Command::FollowUps => {
            let state = store.load()?;
            for contact in views::follow_up_queue(&state) {
                let reason = contact
                    .annotation
                    .as_ref()
                    .and_then(|a| a.follow_up_reason.as_deref())
                    .unwrap_or("-");
                println!("{:<40} {}", contact.address, reason);
            }
            Ok(())
        }
        Command::Draft {
            address,
            save,
            send,
        } => draft(store.as_ref(), &config, &address, save, send).await,
        Command::Reset { yes } => {
            if !yes {
                bail!("This deletes all tracked contacts. Re-run with --yes to confirm.");
            }
            store.reset()?;
            println!("Tracker state reset.");
            Ok(())
        }
    }
}

/// Import a pre-SQLite tracker file from the working directory or the state dir.
fn import_legacy(store: &SqliteStateStore) {
    let mut candidates = vec![PathBuf::from(LEGACY_FILE_NAME)];
    if let Ok(dir) = state_dir() {
        candidates.push(dir.join(LEGACY_FILE_NAME));
    }
    for candidate in candidates {
        match store.import_legacy_if_empty(&candidate) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => log::warn!("Skipping legacy file {}: {}", candidate.display(), e),
        }
    }
}

async fn run_scan(
    store: Arc<SqliteStateStore>,
    config: TrackerConfig,
    mode: ScanMode,
    enrich: bool,
) -> anyhow::Result<()> {
    let source = match GmailThreadSource::connect().await {
        Ok(source) => Arc::new(source),
        Err(e) => return Err(report_failure(ScanError::Auth(e.to_string()))),
    };

    let enrich = enrich || config.enrichment.enabled;
    let oracle_config = config.enrichment.clone();
    let mut orchestrator = ScanOrchestrator::new(source, store, config);
    if enrich {
        if ClaudeCliOracle::is_available() {
            orchestrator = orchestrator.with_oracle(Arc::new(ClaudeCliOracle::new(&oracle_config)));
        } else {
            log::warn!("Claude Code CLI not found; scanning without enrichment");
        }
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, stopping after in-flight requests");
            interrupt.cancel();
        }
    });

    let report = |p: ScanProgress| {
        if p.estimated_total > 0 {
            log::debug!("Scanned {} / ~{} conversations", p.current, p.estimated_total);
        } else {
            log::debug!("Scanned {} conversations", p.current);
        }
    };

    match orchestrator.run_scan(mode, enrich, &cancel, Some(&report)).await {
        Ok(summary) => {
            print_summary(&summary);
            Ok(())
        }
        Err(e) => Err(report_failure(e)),
    }
}

async fn draft(
    store: &SqliteStateStore,
    config: &TrackerConfig,
    address: &str,
    save: bool,
    send: bool,
) -> anyhow::Result<()> {
    let state = store.load()?;
    let key = address.trim().to_lowercase();
    let contact = state
        .contacts
        .get(&key)
        .ok_or_else(|| anyhow!("{} is not a tracked contact", key))?;

    let oracle = ClaudeCliOracle::new(&config.enrichment);
    let text = generate_follow_up_draft(&oracle, contact, config.enrichment.timeout_secs).await;
    println!("{}", text);

    if !save {
        return Ok(());
    }
    if is_draft_placeholder(&text) {
        bail!("No draft text to save");
    }

    let gmail = GmailThreadSource::connect()
        .await
        .map_err(|e| report_failure(ScanError::Auth(e.to_string())))?;
    let mut session = DraftSession::new();
    let saved = session.create(&gmail, &key, FOLLOW_UP_SUBJECT, &text).await?;
    println!("Saved Gmail draft {}", saved.id);

    if send {
        let report = session.send_all(&gmail).await;
        if !report.failed.is_empty() {
            bail!("Sending failed: {}", report.failed[0].1);
        }
        println!("Sent {} draft(s)", report.sent);
    }
    Ok(())
}

fn report_failure(err: ScanError) -> anyhow::Error {
    let failure = ScanFailure::from(&err);
    eprintln!("{}", failure.message);
    eprintln!("{}", failure.recovery_suggestion);
    anyhow!(err)
}

fn print_summary(summary: &ScanSummary) {
    println!(
        "Scan {} ({}): {} conversations, {} contacts tracked",
        summary.run_id, summary.mode, summary.conversations_processed, summary.contacts_tracked
    );
    if summary.fetch_failures > 0 {
        println!("  {} conversations could not be fetched", summary.fetch_failures);
    }
    if !summary.pagination_complete {
        println!("  listing stopped early; results so far were saved");
    }
    if summary.cancelled {
        println!("  cancelled; results so far were saved");
    }
    if summary.contacts_enriched > 0 {
        println!("  {} contacts enriched", summary.contacts_enriched);
    }
}

fn print_contacts(contacts: &[&ContactAggregate]) {
    println!("{:<40} {:>8} {:<12} {:>5}  Last contact", "Address", "Received", "Tier", "Prio");
    for c in contacts {
        let tier = c.tier().map_or("-", |t| t.as_str());
        let priority = c
            .annotation
            .as_ref()
            .map_or_else(|| "-".to_string(), |a| a.priority_score.to_string());
        let last = c
            .last_contact_at
            .map_or_else(|| "-".to_string(), |d| d.format("%Y-%m-%d").to_string());
        println!(
            "{:<40} {:>8} {:<12} {:>5}  {}",
            c.address, c.received_count, tier, priority, last
        );
    }
}
