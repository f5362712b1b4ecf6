use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mailhold::config::Settings;
use mailhold::lease::RunLease;
use mailhold::logging::{self, ERROR, GENERAL};
use mailhold::maildir::MailLayout;
use mailhold::models::{RunReport, RunTarget};
use mailhold::parser::format_date;
use mailhold::providers::pop3::Pop3Connector;
use mailhold::storage::{Storage, StorageError};
use mailhold::sync::SyncEngine;

const LEASE_NAME: &str = "fetch";
const LEASE_BUSY: &str = "another process is working on the mail store, try again later";

type Engine = SyncEngine<Pop3Connector>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(
    name = "mailhold",
    about = "Archive POP3 mailboxes into threaded, searchable local storage"
)]
struct Cli {
    /// Path to the JSON configuration (defaults to $MAILHOLD_CONFIG, then ./mailhold.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch new mail once. Exit code 0 completed, 1 errored, 2 nothing to process.
    Fetch {
        /// Only this account.
        #[arg(long)]
        account: Option<String>,
    },
    /// Fetch repeatedly until interrupted.
    Watch {
        /// Seconds between runs; overrides `poll_interval_secs`.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show server and archive counts.
    Stats {
        #[arg(long)]
        account: Option<String>,
    },
    /// Search stored excerpts.
    Search {
        #[arg(long)]
        account: String,
        /// Match the whole text instead of every word.
        #[arg(long)]
        exact: bool,
        /// List matching threads instead of messages.
        #[arg(long)]
        threads: bool,
        text: String,
    },
    /// Remove all stored mail for an account and forget its watermark.
    Clear {
        #[arg(long)]
        account: String,
        /// Delete files instead of moving them to the trash.
        #[arg(long)]
        skip_trash: bool,
    },
    /// Clear an account and delete its mail directory, trash included.
    Reset {
        #[arg(long)]
        account: String,
    },
}

fn build_engine(settings: &Settings) -> Result<Engine, StorageError> {
    let storage = Storage::open(&settings.database_path)?;
    let connector = Pop3Connector::new(settings.connect_timeout(), settings.fallback_timeout());
    Ok(SyncEngine::new(
        storage,
        connector,
        MailLayout::new(&settings.mail_root),
        settings.accounts.clone(),
        settings.filters.clone(),
    ))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => warn!(target: ERROR, error = %err, "failed to render output"),
    }
}

/// Runs `work` on the blocking pool while holding the whole-process lease.
/// `Ok(None)` means another process held it for the whole wait.
async fn with_lease<T, F>(engine: &Engine, settings: &Settings, work: F) -> Result<Option<T>, BoxError>
where
    F: FnOnce(&Engine, &RunLease) -> T + Send + 'static,
    T: Send + 'static,
{
    let engine = engine.clone();
    let ttl = settings.lease_ttl();
    let wait = settings.lease_wait();

    let outcome = tokio::task::spawn_blocking(move || -> Result<Option<T>, StorageError> {
        let owner = RunLease::new_owner();
        let Some(lease) = RunLease::acquire(engine.storage(), LEASE_NAME, &owner, ttl, wait)? else {
            return Ok(None);
        };
        let value = work(&engine, &lease);
        lease.release();
        Ok(Some(value))
    })
    .await??;
    Ok(outcome)
}

async fn leased_run(engine: &Engine, settings: &Settings, target: RunTarget) -> RunReport {
    match with_lease(engine, settings, move |engine, lease| engine.run_leased(&target, lease)).await {
        Ok(Some(report)) => report,
        Ok(None) => {
            info!(target: GENERAL, "another process is already fetching mail, quitting");
            RunReport::nothing_to_process()
        }
        Err(err) => {
            error!(target: ERROR, error = %err, "fetch run aborted");
            RunReport::errored()
        }
    }
}

async fn watch(engine: &Engine, settings: &Settings, interval: Duration) {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(target: GENERAL, "shutdown requested");
                on_signal.cancel();
            }
            Err(err) => warn!(target: ERROR, error = %err, "cannot listen for ctrl-c"),
        }
    });

    info!(target: GENERAL, interval_secs = interval.as_secs(), "watching mailboxes");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = leased_run(engine, settings, RunTarget::All).await;
        print_json(&report);
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    logging::init_tracing();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    let engine = build_engine(&settings)?;

    match cli.command {
        Command::Fetch { account } => {
            let target = account.map(RunTarget::Account).unwrap_or(RunTarget::All);
            let report = leased_run(&engine, &settings, target).await;
            print_json(&report);
            std::process::exit(report.outcome.exit_code());
        }
        Command::Watch { interval } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.poll_interval())
                .max(Duration::from_secs(1));
            watch(&engine, &settings, interval).await;
        }
        Command::Stats { account } => {
            let addresses: Vec<String> = match account {
                Some(address) => vec![address],
                None => settings.accounts.iter().map(|a| a.address.clone()).collect(),
            };
            for address in addresses {
                let stats = engine.stats(address).await?;
                print_json(&stats);
            }
        }
        Command::Search {
            account,
            exact,
            threads,
            text,
        } => {
            let engine = engine.clone();
            if threads {
                let found = tokio::task::spawn_blocking(move || {
                    engine.search_threads(&account, &text, exact)
                })
                .await??;
                for thread in found {
                    println!(
                        "{:>6}  {}  {}",
                        thread.id,
                        if thread.unread { "*" } else { " " },
                        thread.subject.as_deref().unwrap_or("(no subject)")
                    );
                }
            } else {
                let found = tokio::task::spawn_blocking(move || {
                    engine.search_messages(&account, &text, exact)
                })
                .await??;
                for message in found {
                    println!(
                        "{}  {}  {}  [{}]",
                        message
                            .date
                            .and_then(format_date)
                            .unwrap_or_else(|| "-".into()),
                        message.sender.as_deref().unwrap_or("-"),
                        message.subject.as_deref().unwrap_or("(no subject)"),
                        message.identifier
                    );
                }
            }
        }
        Command::Clear {
            account,
            skip_trash,
        } => {
            let summary = with_lease(&engine, &settings, move |engine, _| {
                engine.clear_all_mail(&account, skip_trash)
            })
            .await?
            .ok_or(LEASE_BUSY)??;
            println!(
                "removed {} message(s), {} kept for retry",
                summary.removed, summary.retained
            );
        }
        Command::Reset { account } => {
            let address = account.clone();
            with_lease(&engine, &settings, move |engine, _| engine.reset_mailbox(&address))
                .await?
                .ok_or(LEASE_BUSY)??;
            println!("mailbox {account} reset");
        }
    }

    Ok(())
}
