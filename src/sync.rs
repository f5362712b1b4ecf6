use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::AccountConfig;
use crate::filters::FilterRule;
use crate::ingest::ingest_message;
use crate::lease::RunLease;
use crate::logging::{DEBUG, ERROR, GENERAL};
use crate::maildir::MailLayout;
use crate::models::{
    Account, AccountReport, AccountStats, ErrorStage, MessageRecord, RunReport, RunTarget,
    ThreadRecord,
};
use crate::providers::{Connector, Mailbox, ProviderError};
use crate::removal::{self, RemovalSummary};
use crate::storage::{MessageQuery, Storage, StorageError};
use crate::watermark::{identifier_at, next_position, unread_remaining, NO_NEW_MAIL};

#[derive(Debug, Error)]
pub enum SyncError {
    /// Authentication, timeout or network failure; the account is skipped.
    #[error("connection failed: {0}")]
    Connection(ProviderError),
    /// Failure mid-session; the rest of the mailbox waits for the next run.
    #[error("protocol failure: {0}")]
    Protocol(ProviderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("could not persist {identifier}: {source}")]
    Persist {
        identifier: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown account {0}")]
    UnknownAccount(String),
    #[error("background task failed: {0}")]
    Join(String),
}

impl From<ProviderError> for SyncError {
    fn from(value: ProviderError) -> Self {
        if value.is_connection_error() {
            SyncError::Connection(value)
        } else {
            SyncError::Protocol(value)
        }
    }
}

/// Drives the fetch loop over configured accounts, one account at a time.
pub struct SyncEngine<C> {
    storage: Storage,
    connector: Arc<C>,
    layout: MailLayout,
    accounts: Arc<Vec<AccountConfig>>,
    filters: Arc<Vec<FilterRule>>,
}

impl<C> Clone for SyncEngine<C> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            connector: Arc::clone(&self.connector),
            layout: self.layout.clone(),
            accounts: Arc::clone(&self.accounts),
            filters: Arc::clone(&self.filters),
        }
    }
}

impl<C: Connector> SyncEngine<C> {
    pub fn new(
        storage: Storage,
        connector: C,
        layout: MailLayout,
        accounts: Vec<AccountConfig>,
        filters: Vec<FilterRule>,
    ) -> Self {
        Self {
            storage,
            connector: Arc::new(connector),
            layout,
            accounts: Arc::new(accounts),
            filters: Arc::new(filters),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn layout(&self) -> &MailLayout {
        &self.layout
    }

    fn account_config(&self, address: &str) -> Option<&AccountConfig> {
        self.accounts
            .iter()
            .find(|account| account.address.eq_ignore_ascii_case(address))
    }

    fn stored_account(&self, address: &str) -> Result<Account, SyncError> {
        let address = self
            .account_config(address)
            .map(|config| config.address.as_str())
            .unwrap_or(address);
        self.storage
            .account_by_address(address)?
            .ok_or_else(|| SyncError::UnknownAccount(address.to_string()))
    }

    /// Runs the fetch loop for the target. Never fails: every problem is
    /// folded into the per-account reports and the overall outcome.
    pub fn run_blocking(&self, target: &RunTarget) -> RunReport {
        self.run_accounts(target, None)
    }

    /// Same as [`run_blocking`](Self::run_blocking), renewing `lease` before
    /// each account. Losing the lease stops the run.
    pub fn run_leased(&self, target: &RunTarget, lease: &RunLease) -> RunReport {
        self.run_accounts(target, Some(lease))
    }

    fn run_accounts(&self, target: &RunTarget, lease: Option<&RunLease>) -> RunReport {
        let selected: Vec<&AccountConfig> = match target {
            RunTarget::All => self.accounts.iter().collect(),
            RunTarget::Account(address) => match self.account_config(address) {
                Some(account) => vec![account],
                None => {
                    warn!(target: GENERAL, account = %address, "no such account configured");
                    Vec::new()
                }
            },
        };

        if selected.is_empty() {
            info!(target: GENERAL, "nothing to process");
            return RunReport::nothing_to_process();
        }

        let mut reports = Vec::with_capacity(selected.len());
        for account in selected {
            if let Some(lease) = lease {
                let lost = match lease.renew() {
                    Ok(true) => None,
                    Ok(false) => Some("run lease was taken over by another process".to_string()),
                    Err(err) => Some(format!("could not renew run lease: {err}")),
                };
                if let Some(reason) = lost {
                    error!(target: ERROR, account = %account.address, reason = %reason, "stopping run");
                    reports.push(AccountReport {
                        address: account.address.clone(),
                        error: true,
                        reason: Some(reason),
                        ..Default::default()
                    });
                    break;
                }
            }
            reports.push(self.sync_account(account));
        }
        let report = RunReport::from_accounts(reports);
        info!(target: GENERAL, outcome = ?report.outcome, accounts = report.accounts.len(), "run finished");
        report
    }

    pub fn sync_account(&self, config: &AccountConfig) -> AccountReport {
        let mut report = AccountReport {
            address: config.address.clone(),
            ..Default::default()
        };

        let account = match self.storage.upsert_account(&config.address) {
            Ok(account) => account,
            Err(err) => {
                error!(target: ERROR, account = %config.address, error = %err, "cannot load account state");
                report.error = true;
                report.reason = Some(err.to_string());
                return report;
            }
        };

        info!(target: GENERAL, account = %config.address, "checking mailbox");
        match self.connector.connect(config) {
            Err(err) => {
                let err = SyncError::from(err);
                warn!(target: ERROR, account = %config.address, error = %err, "skipping account");
                report.error = true;
                report.reason = Some(err.to_string());
            }
            Ok(mut session) => {
                let mut persisted = Vec::new();
                let drained = self.drain(&account, config, &mut session, &mut report, &mut persisted);
                let closed = self.close_session(config, session, &persisted);

                if let Err(err) = drained {
                    warn!(target: ERROR, account = %config.address, error = %err, "mailbox loop stopped");
                    report.error = true;
                    report.reason = Some(err.to_string());
                }
                if let Err(err) = closed {
                    warn!(target: ERROR, account = %config.address, error = %err, "session did not close cleanly");
                    report.error = true;
                    report.reason.get_or_insert_with(|| err.to_string());
                }
            }
        }

        if let Err(err) = self.storage.record_run_summary(account.id, &report) {
            warn!(target: ERROR, account = %config.address, error = %err, "failed to record run summary");
            report.error = true;
        }

        info!(
            target: GENERAL,
            account = %config.address,
            fetched = report.fetched,
            failed = report.failed,
            unread_remaining = report.unread_remaining,
            error = report.error,
            "account finished"
        );
        report
    }

    /// Fetches in increasing position order until nothing is left or a step
    /// fails. The watermark moves only after the message file is durable.
    fn drain(
        &self,
        account: &Account,
        config: &AccountConfig,
        session: &mut C::Session,
        report: &mut AccountReport,
        persisted: &mut Vec<usize>,
    ) -> Result<(), SyncError> {
        let listing = session.list_identifiers()?;
        let mut watermark = account.watermark.clone();

        loop {
            let stat = session.stat()?;
            let position = next_position(&listing, watermark.as_deref(), stat.count);
            report.unread_remaining = unread_remaining(position, stat.count);
            if position == NO_NEW_MAIL || stat.count == 0 {
                info!(target: GENERAL, account = %config.address, "no new mail");
                return Ok(());
            }

            let identifier = identifier_at(&listing, position)
                .ok_or_else(|| {
                    SyncError::Protocol(ProviderError::Protocol(format!(
                        "no identifier listed for position {position}"
                    )))
                })?
                .to_string();

            debug!(target: DEBUG, account = %config.address, position, identifier = %identifier, "retrieving");
            let raw = session.retrieve(position)?;
            if !config.auto_remove {
                session.reset()?;
            }

            let ingested = ingest_message(&self.storage, &self.filters, account.id, &identifier, &raw)?;
            if ingested.created && ingested.record.error {
                report.failed += 1;
            }

            let path = match self.layout.write_message(&config.address, &identifier, &raw) {
                Ok(path) => path,
                Err(source) => {
                    report.failed += 1;
                    self.storage.mark_message_error(
                        ingested.record.id,
                        ErrorStage::Persist,
                        &source.to_string(),
                    )?;
                    return Err(SyncError::Persist { identifier, source });
                }
            };

            self.storage
                .mark_persisted(ingested.record.id, &path.to_string_lossy())?;
            self.storage.set_watermark(account.id, Some(&identifier))?;
            persisted.push(position);
            report.fetched += 1;
            watermark = Some(identifier);
        }
    }

    /// Always sends `QUIT`. Auto-remove accounts first mark the positions
    /// persisted this session for deletion.
    fn close_session(
        &self,
        config: &AccountConfig,
        mut session: C::Session,
        persisted: &[usize],
    ) -> Result<(), ProviderError> {
        let mut first_error = None;
        if config.auto_remove {
            for &position in persisted {
                if let Err(err) = session.delete(position) {
                    first_error = Some(err);
                    break;
                }
            }
            debug!(target: DEBUG, account = %config.address, marked = persisted.len(), "marked persisted messages for removal");
        }
        let closed = session.close();
        match first_error {
            Some(err) => Err(err),
            None => closed,
        }
    }

    pub fn account_stats(&self, address: &str) -> Result<AccountStats, SyncError> {
        let config = self
            .account_config(address)
            .ok_or_else(|| SyncError::UnknownAccount(address.to_string()))?;
        let account = self.storage.upsert_account(&config.address)?;

        let mut stats = AccountStats {
            address: config.address.clone(),
            watermark: account.watermark.clone(),
            saved_threads: self.storage.count_threads(account.id)?,
            saved_messages: self.storage.count_messages(account.id)?,
            errored_messages: self.storage.count_error_messages(account.id)?,
            ..Default::default()
        };

        match self.connector.connect(config) {
            Ok(mut session) => {
                let inspected = inspect_mailbox(&mut session, account.watermark.as_deref());
                if let Err(err) = session.close() {
                    debug!(target: DEBUG, account = %config.address, error = %err, "stats session close failed");
                }
                match inspected {
                    Ok((count, unread)) => {
                        stats.connected = true;
                        stats.server_messages = count;
                        stats.server_unread = unread;
                    }
                    Err(err) => stats.connection_error = Some(err.to_string()),
                }
            }
            Err(err) => stats.connection_error = Some(err.to_string()),
        }
        Ok(stats)
    }

    pub fn clear_all_mail(&self, address: &str, skip_trash: bool) -> Result<RemovalSummary, SyncError> {
        let account = self.stored_account(address)?;
        Ok(removal::clear_all_mail(&self.storage, &self.layout, &account, skip_trash)?)
    }

    pub fn reset_mailbox(&self, address: &str) -> Result<(), SyncError> {
        let account = self.stored_account(address)?;
        Ok(removal::reset_mailbox(&self.storage, &self.layout, &account)?)
    }

    /// Without `exact`, every whitespace-separated word must occur in the
    /// excerpt; with it, the whole text must.
    pub fn search_messages(
        &self,
        address: &str,
        text: &str,
        exact: bool,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        let account = self.stored_account(address)?;
        let lowered = text.to_lowercase();
        let terms = if exact {
            vec![lowered]
        } else {
            lowered.split_whitespace().map(str::to_string).collect()
        };
        Ok(self.storage.query_messages(&MessageQuery {
            account: Some(account.id),
            excerpt_contains: terms,
            ..Default::default()
        })?)
    }

    pub fn search_threads(
        &self,
        address: &str,
        text: &str,
        exact: bool,
    ) -> Result<Vec<ThreadRecord>, SyncError> {
        let mut seen = HashSet::new();
        let mut threads = Vec::new();
        for message in self.search_messages(address, text, exact)? {
            let Some(thread_id) = message.thread_id else {
                continue;
            };
            if !seen.insert(thread_id) {
                continue;
            }
            if let Some(thread) = self.storage.thread(thread_id)? {
                threads.push(thread);
            }
        }
        Ok(threads)
    }
}

fn inspect_mailbox<M: Mailbox>(session: &mut M, watermark: Option<&str>) -> Result<(usize, usize), ProviderError> {
    let listing = session.list_identifiers()?;
    let stat = session.stat()?;
    let position = next_position(&listing, watermark, stat.count);
    Ok((stat.count, unread_remaining(position, stat.count)))
}

impl<C> SyncEngine<C>
where
    C: Connector + Send + Sync + 'static,
{
    /// Async entry point; the blocking loop runs on the blocking pool. A
    /// panic inside the loop is reported as an errored run.
    pub async fn run(&self, target: RunTarget) -> RunReport {
        let engine = self.clone();
        match tokio::task::spawn_blocking(move || engine.run_blocking(&target)).await {
            Ok(report) => report,
            Err(err) => {
                error!(target: ERROR, error = %err, "fetch run aborted");
                RunReport::errored()
            }
        }
    }

    pub async fn stats(&self, address: String) -> Result<AccountStats, SyncError> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.account_stats(&address))
            .await
            .map_err(|err| SyncError::Join(err.to_string()))?
    }
}
