use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::SecretString;
use tracing::info;

use mailhold::config::AccountConfig;
use mailhold::filters::{FieldMatch, FilterRule, MatchPolicy};
use mailhold::logging::{self, TEST};
use mailhold::maildir::MailLayout;
use mailhold::models::{RunOutcome, RunTarget};
use mailhold::providers::{Connector, Listing, Mailbox, MailboxStat, ProviderError};
use mailhold::storage::Storage;
use mailhold::sync::SyncEngine;

const ADDRESS: &str = "alice@example.com";

type Maildrop = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

struct Session {
    maildrop: Maildrop,
}

impl Mailbox for Session {
    fn stat(&mut self) -> Result<MailboxStat, ProviderError> {
        let maildrop = self.maildrop.lock();
        Ok(MailboxStat {
            count: maildrop.len(),
            size: maildrop.iter().map(|(_, raw)| raw.len() as u64).sum(),
        })
    }

    fn list_identifiers(&mut self) -> Result<Vec<Listing>, ProviderError> {
        Ok(self
            .maildrop
            .lock()
            .iter()
            .enumerate()
            .map(|(idx, (id, _))| Listing::new(idx + 1, id.clone()))
            .collect())
    }

    fn retrieve(&mut self, position: usize) -> Result<Vec<u8>, ProviderError> {
        self.maildrop
            .lock()
            .get(position - 1)
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| ProviderError::Protocol(format!("no message {position}")))
    }

    fn delete(&mut self, _position: usize) -> Result<(), ProviderError> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn close(self) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct StaticConnector {
    maildrop: Maildrop,
}

impl Connector for StaticConnector {
    type Session = Session;

    fn connect(&self, _account: &AccountConfig) -> Result<Session, ProviderError> {
        Ok(Session {
            maildrop: Arc::clone(&self.maildrop),
        })
    }
}

fn account() -> AccountConfig {
    AccountConfig {
        address: ADDRESS.into(),
        username: "alice".into(),
        password: SecretString::new("secret".into()),
        server: "pop.example.com".into(),
        pop3s_port: 995,
        pop3_port: 110,
        auto_remove: false,
    }
}

#[tokio::test]
async fn reply_joins_existing_thread_and_advances_watermark() {
    logging::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(&dir.path().join("mailhold.db")).unwrap();

    let stored = storage.upsert_account(ADDRESS).unwrap();
    let existing = storage
        .create_thread(stored.id, "<root> a@x", Some("Original"))
        .unwrap();

    let raw = b"From: Bob <bob@example.org>\r\n\
To: alice@example.com\r\n\
Subject: Hello\r\n\
Message-ID: <hello-1@example.org>\r\n\
References: <a@x>\r\n\
Date: Tue, 14 Nov 2023 22:13:20 +0000\r\n\
\r\n\
Just saying hello.\r\n"
        .to_vec();
    let maildrop: Maildrop = Arc::new(Mutex::new(vec![("uidl-0001".to_string(), raw.clone())]));

    let mut greeting = FilterRule::new("greetings", MatchPolicy::Any, "social");
    greeting.subject = Some(FieldMatch::new("hello", true));

    let layout = MailLayout::new(dir.path().join("mail"));
    let engine = SyncEngine::new(
        storage.clone(),
        StaticConnector { maildrop },
        layout.clone(),
        vec![account()],
        vec![greeting],
    );

    info!(target: TEST, "running end-to-end fetch");
    let report = engine.run(RunTarget::Account(ADDRESS.into())).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.accounts[0].fetched, 1);

    let account = storage.account_by_address(ADDRESS).unwrap().unwrap();
    assert_eq!(account.watermark.as_deref(), Some("uidl-0001"));
    assert!(!account.last_run_error);

    let message = storage
        .message_by_identifier(account.id, "uidl-0001")
        .unwrap()
        .unwrap();
    assert_eq!(message.thread_id, Some(existing.id));
    assert_eq!(message.subject.as_deref(), Some("Hello"));
    assert!(!message.error);
    assert_eq!(storage.count_threads(account.id).unwrap(), 1);

    let thread = storage.thread(existing.id).unwrap().unwrap();
    assert!(thread.unread);
    assert!(thread.thread_key.contains("hello-1@example.org"));
    let tags = storage.tags_for_thread(existing.id).unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "social");

    let path = dir.path().join("mail").join(ADDRESS).join("uidl-0001.eml");
    assert_eq!(std::fs::read(&path).unwrap(), raw);
    assert_eq!(message.file_location.as_deref(), Some(path.to_string_lossy().as_ref()));

    let again = engine.run(RunTarget::All).await;
    assert_eq!(again.outcome, RunOutcome::Completed);
    assert_eq!(again.accounts[0].fetched, 0);
    assert_eq!(storage.count_messages(account.id).unwrap(), 1);
}
