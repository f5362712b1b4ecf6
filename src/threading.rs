use tracing::debug;

use crate::logging::DEBUG;
use crate::models::{MessageRecord, ThreadRecord};
use crate::storage::{Storage, StorageError};

/// Keys tried in order: the message's own key, then its references.
pub fn candidate_keys(message: &MessageRecord) -> Vec<&str> {
    std::iter::once(message.message_key.as_str())
        .chain(message.references.iter().map(String::as_str))
        .filter(|key| !key.trim().is_empty())
        .collect()
}

/// Links `message` to a conversation and marks that conversation unread.
///
/// Matching is a case-insensitive substring test against the accumulated
/// `thread_key`, so a short key can match a longer unrelated one. The first
/// candidate with any hit wins; ties go to the newest thread. When nothing
/// matches a new thread keyed by `message_key` is created.
pub fn assign_thread(
    storage: &Storage,
    account_id: i64,
    message: &mut MessageRecord,
) -> Result<ThreadRecord, StorageError> {
    let mut matched = None;
    for candidate in candidate_keys(message) {
        if let Some(thread) = storage.find_thread_containing(account_id, candidate)? {
            debug!(
                target: DEBUG,
                identifier = %message.identifier,
                candidate,
                thread = thread.id,
                "matched existing thread"
            );
            matched = Some(thread);
            break;
        }
    }

    let mut thread = match matched {
        Some(mut thread) => {
            let key = message.message_key.to_lowercase();
            if !key.is_empty() && !thread.thread_key.to_lowercase().contains(&key) {
                thread.thread_key = format!("{} {}", thread.thread_key, message.message_key);
                storage.set_thread_key(thread.id, &thread.thread_key)?;
            }
            thread
        }
        None => {
            let thread = storage.create_thread(
                account_id,
                &message.message_key,
                message.subject.as_deref(),
            )?;
            debug!(
                target: DEBUG,
                identifier = %message.identifier,
                thread = thread.id,
                "started new thread"
            );
            thread
        }
    };

    storage.set_thread_unread(thread.id, true)?;
    thread.unread = true;
    message.thread_id = Some(thread.id);
    Ok(thread)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_stub(storage: &Storage, account_id: i64, identifier: &str, key: &str, refs: &[&str]) -> MessageRecord {
        let (mut record, _) = storage.get_or_create_message(account_id, identifier).unwrap();
        record.message_key = key.into();
        record.subject = Some(format!("subject of {identifier}"));
        record.references = refs.iter().map(|r| r.to_string()).collect();
        record
    }

    #[test]
    fn reply_joins_referenced_thread() {
        let storage = Storage::open_in_memory().unwrap();
        let account = storage.upsert_account("alice@example.com").unwrap();

        let mut first = ingest_stub(&storage, account.id, "uid-a", "a@x", &[]);
        let thread_a = assign_thread(&storage, account.id, &mut first).unwrap();
        assert_eq!(thread_a.thread_key, "a@x");
        assert_eq!(thread_a.subject.as_deref(), Some("subject of uid-a"));

        let mut reply = ingest_stub(&storage, account.id, "uid-b", "b@x", &["A@X"]);
        let thread_b = assign_thread(&storage, account.id, &mut reply).unwrap();
        assert_eq!(thread_b.id, thread_a.id);
        assert_eq!(reply.thread_id, Some(thread_a.id));
        assert_eq!(thread_b.thread_key, "a@x b@x");
        assert_eq!(
            storage.thread(thread_a.id).unwrap().unwrap().thread_key,
            "a@x b@x"
        );
    }

    #[test]
    fn unmatched_message_starts_thread_with_own_key() {
        let storage = Storage::open_in_memory().unwrap();
        let account = storage.upsert_account("alice@example.com").unwrap();

        let mut lone = ingest_stub(&storage, account.id, "uid-c", "c@x", &["nothing@here"]);
        let thread = assign_thread(&storage, account.id, &mut lone).unwrap();
        assert_eq!(thread.thread_key, "c@x");
        assert!(thread.unread);
        assert_eq!(storage.count_threads(account.id).unwrap(), 1);
    }

    #[test]
    fn own_key_is_tried_before_references() {
        let storage = Storage::open_in_memory().unwrap();
        let account = storage.upsert_account("alice@example.com").unwrap();
        let by_key = storage.create_thread(account.id, "k@x", None).unwrap();
        let _by_ref = storage.create_thread(account.id, "r@x", None).unwrap();

        let mut message = ingest_stub(&storage, account.id, "uid-d", "k@x", &["r@x"]);
        let thread = assign_thread(&storage, account.id, &mut message).unwrap();
        assert_eq!(thread.id, by_key.id);
        assert_eq!(thread.thread_key, "k@x");
    }

    #[test]
    fn assignment_marks_thread_unread() {
        let storage = Storage::open_in_memory().unwrap();
        let account = storage.upsert_account("alice@example.com").unwrap();
        let existing = storage.create_thread(account.id, "a@x", None).unwrap();
        storage.set_thread_unread(existing.id, false).unwrap();

        let mut reply = ingest_stub(&storage, account.id, "uid-e", "e@x", &["a@x"]);
        assign_thread(&storage, account.id, &mut reply).unwrap();
        assert!(storage.thread(existing.id).unwrap().unwrap().unread);
    }

    #[test]
    fn threads_are_scoped_per_account() {
        let storage = Storage::open_in_memory().unwrap();
        let alice = storage.upsert_account("alice@example.com").unwrap();
        let bob = storage.upsert_account("bob@example.com").unwrap();
        storage.create_thread(alice.id, "a@x", None).unwrap();

        let mut reply = ingest_stub(&storage, bob.id, "uid-f", "f@x", &["a@x"]);
        let thread = assign_thread(&storage, bob.id, &mut reply).unwrap();
        assert_eq!(thread.account_id, Some(bob.id));
        assert_eq!(thread.thread_key, "f@x");
    }
}
