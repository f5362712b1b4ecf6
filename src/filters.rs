use serde::Deserialize;
use tracing::debug;

use crate::logging::DEBUG;
use crate::models::MessageRecord;
use crate::storage::{Storage, StorageError};

/// One field predicate. An empty `value` leaves the field unconfigured.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FieldMatch {
    pub value: String,
    #[serde(default)]
    pub exact: bool,
}

impl FieldMatch {
    pub fn new(value: impl Into<String>, exact: bool) -> Self {
        Self {
            value: value.into(),
            exact,
        }
    }

    fn is_configured(&self) -> bool {
        !self.value.is_empty()
    }

    /// Case-insensitive comparison; a message without the field never matches.
    fn matches(&self, field: Option<&str>) -> bool {
        let Some(field) = field else {
            return false;
        };
        let wanted = self.value.to_lowercase();
        let actual = field.to_lowercase();
        if self.exact {
            actual == wanted
        } else {
            actual.contains(&wanted)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    All,
    Any,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterRule {
    pub name: String,
    #[serde(default)]
    pub match_all: bool,
    #[serde(default)]
    pub subject: Option<FieldMatch>,
    #[serde(default)]
    pub sender: Option<FieldMatch>,
    #[serde(default)]
    pub recipient: Option<FieldMatch>,
    #[serde(default)]
    pub excerpt: Option<FieldMatch>,
    #[serde(default)]
    pub cc: Option<FieldMatch>,
    #[serde(default)]
    pub bcc: Option<FieldMatch>,
    pub tag: String,
}

impl FilterRule {
    pub fn new(name: impl Into<String>, policy: MatchPolicy, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            match_all: policy == MatchPolicy::All,
            subject: None,
            sender: None,
            recipient: None,
            excerpt: None,
            cc: None,
            bcc: None,
            tag: tag.into(),
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        if self.match_all {
            MatchPolicy::All
        } else {
            MatchPolicy::Any
        }
    }

    fn predicates<'a>(&'a self, message: &'a MessageRecord) -> [(Option<&'a FieldMatch>, Option<&'a str>); 6] {
        [
            (self.subject.as_ref(), message.subject.as_deref()),
            (self.sender.as_ref(), message.sender.as_deref()),
            (self.recipient.as_ref(), message.recipient.as_deref()),
            (self.excerpt.as_ref(), Some(message.excerpt.as_str())),
            (self.cc.as_ref(), message.cc.as_deref()),
            (self.bcc.as_ref(), message.bcc.as_deref()),
        ]
    }

    /// Evaluates the rule. Match-all stops at the first mismatch and holds
    /// vacuously when nothing is configured; match-any stops at the first hit.
    pub fn matches(&self, message: &MessageRecord) -> bool {
        let mut configured = self
            .predicates(message)
            .into_iter()
            .filter_map(|(rule, field)| {
                rule.filter(|rule| rule.is_configured())
                    .map(|rule| rule.matches(field))
            });

        match self.policy() {
            MatchPolicy::All => configured.all(|hit| hit),
            MatchPolicy::Any => configured.any(|hit| hit),
        }
    }
}

/// Runs every rule in order and tags the message's thread for each hit.
/// Returns the names of the rules that matched.
pub fn apply_filters(
    storage: &Storage,
    rules: &[FilterRule],
    message: &MessageRecord,
) -> Result<Vec<String>, StorageError> {
    let Some(thread_id) = message.thread_id else {
        return Ok(Vec::new());
    };

    let mut matched = Vec::new();
    for rule in rules {
        if !rule.matches(message) {
            continue;
        }
        let tag = storage.ensure_tag(&rule.tag)?;
        storage.attach_tag(thread_id, tag.id)?;
        debug!(
            target: DEBUG,
            rule = %rule.name,
            tag = %rule.tag,
            thread = thread_id,
            identifier = %message.identifier,
            "filter matched"
        );
        matched.push(rule.name.clone());
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> MessageRecord {
        MessageRecord {
            id: 1,
            account_id: Some(1),
            thread_id: None,
            identifier: "uid-1".into(),
            message_key: "m1@example.com".into(),
            sender: Some("Billing@Example.com".into()),
            recipient: Some("alice@example.com".into()),
            in_reply_to: None,
            references: Vec::new(),
            subject: Some("Your March Invoice".into()),
            date: None,
            cc: None,
            bcc: None,
            excerpt: "your march invoice amount due".into(),
            file_location: None,
            error: false,
            error_text: None,
            error_stage: None,
        }
    }

    fn rule(policy: MatchPolicy) -> FilterRule {
        let mut rule = FilterRule::new("invoices", policy, "finance");
        rule.subject = Some(FieldMatch::new("invoice", false));
        rule.sender = Some(FieldMatch::new("someone-else@example.com", true));
        rule
    }

    #[test]
    fn match_all_requires_every_configured_field() {
        assert!(!rule(MatchPolicy::All).matches(&message()));

        let mut both = rule(MatchPolicy::All);
        both.sender = Some(FieldMatch::new("billing@example.com", true));
        assert!(both.matches(&message()));
    }

    #[test]
    fn match_any_needs_one_field() {
        assert!(rule(MatchPolicy::Any).matches(&message()));

        let mut none = rule(MatchPolicy::Any);
        none.subject = Some(FieldMatch::new("receipt", false));
        assert!(!none.matches(&message()));
    }

    #[test]
    fn exact_comparison_is_case_insensitive_equality() {
        let mut exact = FilterRule::new("subject", MatchPolicy::All, "t");
        exact.subject = Some(FieldMatch::new("your march invoice", true));
        assert!(exact.matches(&message()));

        exact.subject = Some(FieldMatch::new("march", true));
        assert!(!exact.matches(&message()));
    }

    #[test]
    fn missing_field_never_matches() {
        let mut cc = FilterRule::new("cc", MatchPolicy::Any, "t");
        cc.cc = Some(FieldMatch::new("carol", false));
        assert!(!cc.matches(&message()));
    }

    #[test]
    fn empty_values_are_ignored() {
        let mut blank = FilterRule::new("blank", MatchPolicy::All, "t");
        blank.subject = Some(FieldMatch::new("", false));
        assert!(blank.matches(&message()));
        blank.match_all = false;
        assert!(!blank.matches(&message()));
    }

    #[test]
    fn tags_resolved_thread_once() {
        let storage = Storage::open_in_memory().unwrap();
        let account = storage.upsert_account("alice@example.com").unwrap();
        let thread = storage.create_thread(account.id, "m1@example.com", None).unwrap();
        let mut message = message();
        message.thread_id = Some(thread.id);

        let rules = vec![rule(MatchPolicy::Any), rule(MatchPolicy::Any), rule(MatchPolicy::All)];
        let matched = apply_filters(&storage, &rules, &message).unwrap();
        assert_eq!(matched.len(), 2);

        let tags = storage.tags_for_thread(thread.id).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "finance");
    }
}
