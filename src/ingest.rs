use thiserror::Error;
use tracing::{debug, warn};

use crate::filters::{apply_filters, FilterRule};
use crate::logging::{DEBUG, ERROR};
use crate::models::{ErrorStage, MessageRecord};
use crate::parser::{parse_message, IngestError};
use crate::storage::{Storage, StorageError};
use crate::threading::assign_thread;

#[derive(Debug, Error)]
enum IngestFailure {
    #[error(transparent)]
    Parse(#[from] IngestError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub record: MessageRecord,
    /// False when the message was already known and left untouched.
    pub created: bool,
}

/// Turns a raw message into a stored record.
///
/// Known `(account, identifier)` pairs are returned as stored. Extraction
/// failures never escape: the record is saved with its error flag and text set
/// and returned like any other. Only a failure of the store itself is an `Err`.
pub fn ingest_message(
    storage: &Storage,
    rules: &[FilterRule],
    account_id: i64,
    identifier: &str,
    raw: &[u8],
) -> Result<Ingested, StorageError> {
    let (mut record, created) = storage.get_or_create_message(account_id, identifier)?;
    if !created {
        debug!(target: DEBUG, identifier, "message already ingested, skipping");
        return Ok(Ingested {
            record,
            created: false,
        });
    }

    match populate(storage, rules, account_id, &mut record, raw) {
        Ok(()) => record.clear_error(),
        Err(failure) => {
            let text = format!("error saving message {}: {failure}", record.message_key);
            warn!(target: ERROR, identifier, error = %failure, "message ingest failed");
            record.set_error(ErrorStage::Ingest, text);
        }
    }
    storage.save_message(&record)?;

    Ok(Ingested {
        record,
        created: true,
    })
}

fn populate(
    storage: &Storage,
    rules: &[FilterRule],
    account_id: i64,
    record: &mut MessageRecord,
    raw: &[u8],
) -> Result<(), IngestFailure> {
    let parsed = parse_message(raw, &record.identifier)?;
    record.message_key = parsed.message_key;
    record.sender = parsed.sender;
    record.recipient = parsed.recipient;
    record.in_reply_to = parsed.in_reply_to;
    record.references = parsed.references;
    record.subject = parsed.subject;
    record.date = parsed.date;
    record.cc = parsed.cc;
    record.bcc = parsed.bcc;
    record.excerpt = parsed.excerpt;

    assign_thread(storage, account_id, record)?;
    apply_filters(storage, rules, record)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{FieldMatch, MatchPolicy};

    const RAW: &[u8] = b"From: Billing <billing@example.com>\r\n\
To: alice@example.com\r\n\
Subject: Invoice 42\r\n\
Message-ID: <inv42@example.com>\r\n\
Date: Tue, 14 Nov 2023 22:13:20 +0000\r\n\
\r\n\
Amount due: 10 EUR\r\n";

    fn setup() -> (Storage, i64) {
        let storage = Storage::open_in_memory().unwrap();
        let account = storage.upsert_account("alice@example.com").unwrap();
        (storage, account.id)
    }

    #[test]
    fn ingesting_twice_keeps_one_record() {
        let (storage, account_id) = setup();
        let first = ingest_message(&storage, &[], account_id, "uid-1", RAW).unwrap();
        assert!(first.created);
        assert!(!first.record.error);

        let second = ingest_message(&storage, &[], account_id, "uid-1", RAW).unwrap();
        assert!(!second.created);
        assert_eq!(second.record, first.record);
        assert_eq!(storage.count_messages(account_id).unwrap(), 1);
        assert_eq!(storage.count_threads(account_id).unwrap(), 1);
    }

    #[test]
    fn successful_ingest_threads_and_tags() {
        let (storage, account_id) = setup();
        let mut rule = FilterRule::new("invoices", MatchPolicy::All, "finance");
        rule.subject = Some(FieldMatch::new("invoice", false));
        rule.excerpt = Some(FieldMatch::new("amount due", false));

        let ingested = ingest_message(&storage, &[rule], account_id, "uid-1", RAW).unwrap();
        let record = ingested.record;
        assert_eq!(record.message_key, "inv42@example.com");
        assert_eq!(record.sender.as_deref(), Some("billing@example.com"));
        assert_eq!(record.excerpt, "invoice 42 amount due: 10 eur");

        let thread_id = record.thread_id.unwrap();
        let thread = storage.thread(thread_id).unwrap().unwrap();
        assert_eq!(thread.thread_key, "inv42@example.com");
        assert!(thread.unread);
        let tags = storage.tags_for_thread(thread_id).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "finance");

        let stored = storage.message(record.id).unwrap().unwrap();
        assert_eq!(stored.error_stage, None);
    }

    #[test]
    fn parse_failure_is_recorded_not_raised() {
        let (storage, account_id) = setup();
        let raw = b"Subject: broken\r\nDate: the day after tomorrow\r\n\r\nbody\r\n";
        let ingested = ingest_message(&storage, &[], account_id, "uid-2", raw).unwrap();
        assert!(ingested.created);

        let stored = storage.message(ingested.record.id).unwrap().unwrap();
        assert!(stored.error);
        assert_eq!(stored.error_stage, Some(ErrorStage::Ingest));
        assert!(stored.error_text.unwrap().contains("date"));
        assert_eq!(stored.thread_id, None);
    }
}
