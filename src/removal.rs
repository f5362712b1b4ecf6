use std::fs;
use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::logging::{ERROR, GENERAL};
use crate::maildir::{MailLayout, TrashOutcome};
use crate::models::{Account, ErrorStage, MessageRecord};
use crate::storage::{Storage, StorageError};

/// Tally of a bulk removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalSummary {
    pub removed: usize,
    /// Records kept because their file could not be moved to the trash.
    pub retained: usize,
}

/// Removes one message. Returns whether the record was deleted.
///
/// A thread left with no other message is dropped first; the message is
/// detached beforehand so the thread's cascade does not take the record with
/// it. With `skip_trash` the file is deleted and the record always goes.
/// Otherwise the record goes only once the file is in the trash.
pub fn remove_message(
    storage: &Storage,
    layout: &MailLayout,
    message: &MessageRecord,
    skip_trash: bool,
) -> Result<bool, StorageError> {
    if let Some(thread_id) = message.thread_id {
        if storage.count_messages_in_thread(thread_id)? <= 1 {
            storage.detach_from_thread(message.id)?;
            storage.delete_thread(thread_id)?;
        }
    }

    let location = message.file_location.as_deref().map(Path::new);

    if skip_trash {
        if let Some(location) = location {
            if let Err(err) = fs::remove_file(location) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        target: ERROR,
                        file = %location.display(),
                        error = %err,
                        "unable to delete message file"
                    );
                }
            }
        }
        storage.delete_message(message.id)?;
        return Ok(true);
    }

    let outcome = match location {
        Some(location) => layout.trash_file(location),
        None => Ok(TrashOutcome::Missing),
    };
    match outcome {
        Ok(_) => {
            storage.delete_message(message.id)?;
            Ok(true)
        }
        Err(err) => {
            warn!(
                target: ERROR,
                identifier = %message.identifier,
                error = %err,
                "unable to move message to trash"
            );
            storage.mark_message_error(message.id, ErrorStage::Trash, &err.to_string())?;
            Ok(false)
        }
    }
}

/// Removes every message of a thread, then the thread itself.
pub fn remove_thread(
    storage: &Storage,
    layout: &MailLayout,
    thread_id: i64,
    skip_trash: bool,
) -> Result<RemovalSummary, StorageError> {
    let mut summary = RemovalSummary::default();
    for message in storage.messages_for_thread(thread_id)? {
        if remove_message(storage, layout, &message, skip_trash)? {
            summary.removed += 1;
        } else {
            summary.retained += 1;
        }
    }
    // Survivors are kept for a later retry; they must outlive the thread.
    storage.detach_thread_messages(thread_id)?;
    storage.delete_thread(thread_id)?;
    Ok(summary)
}

/// Removes all threads and messages of the account and forgets its watermark,
/// so the next run resyncs from the first server position.
pub fn clear_all_mail(
    storage: &Storage,
    layout: &MailLayout,
    account: &Account,
    skip_trash: bool,
) -> Result<RemovalSummary, StorageError> {
    let mut summary = RemovalSummary::default();
    for thread in storage.threads_for_account(account.id)? {
        let removed = remove_thread(storage, layout, thread.id, skip_trash)?;
        summary.removed += removed.removed;
        summary.retained += removed.retained;
    }
    // Messages retained above were detached, so they are orphans now and get
    // one more attempt here.
    summary.retained = 0;
    for message in storage.orphan_messages(account.id)? {
        if remove_message(storage, layout, &message, skip_trash)? {
            summary.removed += 1;
        } else {
            summary.retained += 1;
        }
    }
    storage.set_watermark(account.id, None)?;

    info!(
        target: GENERAL,
        account = %account.address,
        removed = summary.removed,
        retained = summary.retained,
        skip_trash,
        "cleared stored mail"
    );
    Ok(summary)
}

/// Hard-clears the account and deletes its whole mail directory.
pub fn reset_mailbox(
    storage: &Storage,
    layout: &MailLayout,
    account: &Account,
) -> Result<(), StorageError> {
    clear_all_mail(storage, layout, account, true)?;
    layout.remove_account_dir(&account.address)?;
    info!(target: GENERAL, account = %account.address, "mailbox reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ingest_message;

    const ADDRESS: &str = "alice@example.com";

    fn raw(key: &str, refs: &str) -> Vec<u8> {
        format!("Subject: s\r\nMessage-ID: <{key}>\r\nReferences: {refs}\r\n\r\nbody\r\n").into_bytes()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Storage,
        layout: MailLayout,
        account: Account,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = MailLayout::new(dir.path());
            let storage = Storage::open_in_memory().unwrap();
            let account = storage.upsert_account(ADDRESS).unwrap();
            Self {
                _dir: dir,
                storage,
                layout,
                account,
            }
        }

        fn deliver(&self, identifier: &str, key: &str, refs: &str) -> MessageRecord {
            let raw = raw(key, refs);
            let ingested =
                ingest_message(&self.storage, &[], self.account.id, identifier, &raw).unwrap();
            let path = self.layout.write_message(ADDRESS, identifier, &raw).unwrap();
            let location = path.to_string_lossy().to_string();
            self.storage.mark_persisted(ingested.record.id, &location).unwrap();
            self.storage.message(ingested.record.id).unwrap().unwrap()
        }
    }

    #[test]
    fn removing_last_message_drops_thread_and_trashes_file() {
        let fx = Fixture::new();
        let message = fx.deliver("uid-1", "a@x", "");
        let thread_id = message.thread_id.unwrap();

        assert!(remove_message(&fx.storage, &fx.layout, &message, false).unwrap());
        assert!(fx.storage.thread(thread_id).unwrap().is_none());
        assert!(fx.storage.message(message.id).unwrap().is_none());
        assert!(fx.layout.trash_dir(ADDRESS).join("uid-1.eml").exists());
    }

    #[test]
    fn thread_survives_while_other_messages_remain() {
        let fx = Fixture::new();
        let first = fx.deliver("uid-1", "a@x", "");
        let reply = fx.deliver("uid-2", "b@x", "<a@x>");
        assert_eq!(first.thread_id, reply.thread_id);

        assert!(remove_message(&fx.storage, &fx.layout, &reply, false).unwrap());
        let thread_id = first.thread_id.unwrap();
        assert!(fx.storage.thread(thread_id).unwrap().is_some());
        assert_eq!(fx.storage.count_messages_in_thread(thread_id).unwrap(), 1);
    }

    #[test]
    fn removing_twice_with_trash_is_idempotent() {
        let fx = Fixture::new();
        let message = fx.deliver("uid-1", "a@x", "");
        assert!(remove_message(&fx.storage, &fx.layout, &message, false).unwrap());

        let again = fx.deliver("uid-1", "a@x", "");
        assert!(remove_message(&fx.storage, &fx.layout, &again, false).unwrap());
        assert!(remove_message(&fx.storage, &fx.layout, &again, false).unwrap());
        assert_eq!(fx.storage.count_messages(fx.account.id).unwrap(), 0);
    }

    #[test]
    fn skip_trash_deletes_file() {
        let fx = Fixture::new();
        let message = fx.deliver("uid-1", "a@x", "");
        let location = message.file_location.clone().unwrap();

        assert!(remove_message(&fx.storage, &fx.layout, &message, true).unwrap());
        assert!(!Path::new(&location).exists());
        assert!(!fx.layout.trash_dir(ADDRESS).join("uid-1.eml").exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_trash_keeps_record_with_error() {
        let fx = Fixture::new();
        let message = fx.deliver("uid-1", "a@x", "");
        // A regular file where the trash directory should be.
        fs::write(fx.layout.trash_dir(ADDRESS), b"not a directory").unwrap();

        assert!(!remove_message(&fx.storage, &fx.layout, &message, false).unwrap());
        let kept = fx.storage.message(message.id).unwrap().unwrap();
        assert!(kept.error);
        assert_eq!(kept.error_stage, Some(ErrorStage::Trash));
        assert_eq!(kept.thread_id, None);
    }

    #[test]
    fn clear_all_mail_empties_account_and_watermark() {
        let fx = Fixture::new();
        fx.deliver("uid-1", "a@x", "");
        fx.deliver("uid-2", "b@x", "<a@x>");
        fx.deliver("uid-3", "c@x", "");
        fx.storage.set_watermark(fx.account.id, Some("uid-3")).unwrap();

        let summary = clear_all_mail(&fx.storage, &fx.layout, &fx.account, false).unwrap();
        assert_eq!(summary, RemovalSummary { removed: 3, retained: 0 });
        assert_eq!(fx.storage.count_messages(fx.account.id).unwrap(), 0);
        assert_eq!(fx.storage.count_threads(fx.account.id).unwrap(), 0);
        assert_eq!(fx.storage.account(fx.account.id).unwrap().unwrap().watermark, None);
        assert!(fx.layout.trash_dir(ADDRESS).join("uid-2.eml").exists());
    }

    #[test]
    fn clear_all_mail_sweeps_threadless_records() {
        let fx = Fixture::new();
        fx.deliver("uid-1", "a@x", "");
        let (pending, created) = fx.storage.get_or_create_message(fx.account.id, "uid-2").unwrap();
        assert!(created);
        assert_eq!(pending.thread_id, None);

        let summary = clear_all_mail(&fx.storage, &fx.layout, &fx.account, false).unwrap();
        assert_eq!(summary, RemovalSummary { removed: 2, retained: 0 });
        assert!(fx.storage.orphan_messages(fx.account.id).unwrap().is_empty());
        assert_eq!(fx.storage.count_messages(fx.account.id).unwrap(), 0);
    }

    #[test]
    fn reset_removes_directory() {
        let fx = Fixture::new();
        fx.deliver("uid-1", "a@x", "");
        reset_mailbox(&fx.storage, &fx.layout, &fx.account).unwrap();
        assert!(!fx.layout.account_dir(ADDRESS).exists());
        assert_eq!(fx.storage.count_messages(fx.account.id).unwrap(), 0);
    }
}
