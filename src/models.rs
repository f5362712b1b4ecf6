use serde::Serialize;
use std::fmt::{self, Display};

/// Stored per-account sync state.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub address: String,
    pub watermark: Option<String>,
    pub last_run_at: Option<i64>,
    pub last_run_error: bool,
    pub last_unread: i64,
}

/// Stage at which a message record last failed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    /// Created but ingest has not finished yet.
    Pending,
    Ingest,
    Persist,
    Trash,
}

impl ErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStage::Pending => "pending",
            ErrorStage::Ingest => "ingest",
            ErrorStage::Persist => "persist",
            ErrorStage::Trash => "trash",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "ingest" => ErrorStage::Ingest,
            "persist" => ErrorStage::Persist,
            "trash" => ErrorStage::Trash,
            _ => ErrorStage::Pending,
        }
    }
}

impl Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub account_id: Option<i64>,
    pub thread_id: Option<i64>,
    pub identifier: String,
    pub message_key: String,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: Option<String>,
    /// UTC unix seconds.
    pub date: Option<i64>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub excerpt: String,
    pub file_location: Option<String>,
    pub error: bool,
    pub error_text: Option<String>,
    pub error_stage: Option<ErrorStage>,
}

impl MessageRecord {
    pub fn set_error(&mut self, stage: ErrorStage, text: impl Into<String>) {
        self.error = true;
        self.error_stage = Some(stage);
        self.error_text = Some(text.into());
    }

    pub fn clear_error(&mut self) {
        self.error = false;
        self.error_stage = None;
        self.error_text = None;
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreadRecord {
    pub id: i64,
    pub account_id: Option<i64>,
    pub thread_key: String,
    pub subject: Option<String>,
    pub unread: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// Which accounts a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    All,
    Account(String),
}

/// Tri-state result of one automation run.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Errored,
    Completed,
    NothingToProcess,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Errored => 1,
            RunOutcome::NothingToProcess => 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountReport {
    pub address: String,
    pub error: bool,
    /// Human-readable reason for `error`, when there is one.
    pub reason: Option<String>,
    pub fetched: usize,
    pub failed: usize,
    pub unread_remaining: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub accounts: Vec<AccountReport>,
}

impl RunReport {
    pub fn nothing_to_process() -> Self {
        Self {
            outcome: RunOutcome::NothingToProcess,
            accounts: Vec::new(),
        }
    }

    pub fn errored() -> Self {
        Self {
            outcome: RunOutcome::Errored,
            accounts: Vec::new(),
        }
    }

    pub fn from_accounts(accounts: Vec<AccountReport>) -> Self {
        let outcome = if accounts.is_empty() {
            RunOutcome::NothingToProcess
        } else if accounts.iter().any(|report| report.error) {
            RunOutcome::Errored
        } else {
            RunOutcome::Completed
        };
        Self { outcome, accounts }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountStats {
    pub address: String,
    pub connected: bool,
    pub connection_error: Option<String>,
    pub watermark: Option<String>,
    pub server_messages: usize,
    pub server_unread: usize,
    pub saved_threads: usize,
    pub saved_messages: usize,
    pub errored_messages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(error: bool) -> AccountReport {
        AccountReport {
            address: "a@example.com".into(),
            error,
            ..Default::default()
        }
    }

    #[test]
    fn outcome_follows_account_reports() {
        assert_eq!(RunReport::from_accounts(vec![]).outcome, RunOutcome::NothingToProcess);
        assert_eq!(
            RunReport::from_accounts(vec![report(false), report(false)]).outcome,
            RunOutcome::Completed
        );
        assert_eq!(
            RunReport::from_accounts(vec![report(false), report(true)]).outcome,
            RunOutcome::Errored
        );
    }

    #[test]
    fn error_stage_round_trips_through_text() {
        for stage in [ErrorStage::Pending, ErrorStage::Ingest, ErrorStage::Persist, ErrorStage::Trash] {
            assert_eq!(ErrorStage::from_str(stage.as_str()), stage);
        }
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::Errored.exit_code(), 1);
        assert_eq!(RunOutcome::NothingToProcess.exit_code(), 2);
    }
}
