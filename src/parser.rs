//! Best-effort extraction of the fields the archive indexes.
//!
//! Address handling is intentionally lossy and not RFC 5322 aware: a header is
//! reduced to the tokens that look like addresses, falling back to any
//! bracket-free token, and finally to the raw header value itself.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::logging::DEBUG;

/// Upper bound on the stored excerpt, in characters.
pub const EXCERPT_LIMIT: usize = 16_383;

const HTML_RENDER_WIDTH: usize = 10_000;

static ADDRESS_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^<>,\s]+@[^<>,\s]+").expect("valid address pattern"));
static BARE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^<>\s]+").expect("valid token pattern"));

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("mime parse error: {0}")]
    Mime(#[from] mailparse::MailParseError),
    #[error("message has no readable body")]
    MissingBody,
    #[error("unparseable date header: {0}")]
    InvalidDate(String),
}

/// Fields extracted from one raw message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub message_key: String,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: Option<String>,
    pub date: Option<i64>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub excerpt: String,
}

/// Splits a header value into address-like tokens, order preserved.
pub fn extract_tokens(value: &str) -> Vec<String> {
    let found = collect_matches(&ADDRESS_TOKEN, value);
    if !found.is_empty() {
        return found;
    }
    let found = collect_matches(&BARE_TOKEN, value);
    if !found.is_empty() {
        return found;
    }
    literal_token(value)
}

pub fn first_token(value: &str) -> Option<String> {
    extract_tokens(value).into_iter().next()
}

fn collect_matches(pattern: &Regex, value: &str) -> Vec<String> {
    pattern
        .find_iter(value)
        .map(|found| found.as_str().to_string())
        .collect()
}

fn literal_token(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Vec::new()
    } else {
        vec![trimmed.to_string()]
    }
}

/// The message's own id when it is `@`-qualified, otherwise `identifier`.
pub fn message_key(message_id: Option<&str>, identifier: &str) -> String {
    message_id
        .filter(|value| value.contains('@'))
        .and_then(first_token)
        .unwrap_or_else(|| identifier.to_string())
}

/// Parses a date header into UTC seconds. Dates without an offset are taken
/// to be in the local timezone.
pub fn parse_date(raw: &str) -> Result<i64, IngestError> {
    let raw = raw.trim();
    match dateparser::parse(raw) {
        Ok(parsed) => Ok(parsed.timestamp()),
        Err(first) => mailparse::dateparse(raw).map_err(|second| {
            IngestError::InvalidDate(format!("{raw}: {first}; {second}"))
        }),
    }
}

pub fn format_date(timestamp: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).map(|date| date.to_rfc3339())
}

fn is_attachment(part: &ParsedMail<'_>) -> bool {
    part.get_content_disposition().disposition == DispositionType::Attachment
}

fn find_part<'a, 'b>(
    part: &'b ParsedMail<'a>,
    predicate: &dyn Fn(&ParsedMail<'a>) -> bool,
) -> Option<&'b ParsedMail<'a>> {
    if predicate(part) {
        return Some(part);
    }
    part.subparts
        .iter()
        .find_map(|sub| find_part(sub, predicate))
}

fn is_leaf_of(part: &ParsedMail<'_>, mimetype: &str) -> bool {
    part.subparts.is_empty()
        && part.ctype.mimetype.eq_ignore_ascii_case(mimetype)
        && !is_attachment(part)
}

fn is_text_leaf(part: &ParsedMail<'_>) -> bool {
    part.subparts.is_empty()
        && part.ctype.mimetype.to_ascii_lowercase().starts_with("text/")
        && !is_attachment(part)
}

/// Picks the body in preference order: html, the root of a related
/// container, then plain text.
fn select_body<'a, 'b>(root: &'b ParsedMail<'a>) -> Option<&'b ParsedMail<'a>> {
    if let Some(html) = find_part(root, &|part| is_leaf_of(part, "text/html")) {
        return Some(html);
    }
    if let Some(related) = find_part(root, &|part| {
        part.ctype.mimetype.eq_ignore_ascii_case("multipart/related")
    }) {
        if let Some(text) = find_part(related, &is_text_leaf) {
            return Some(text);
        }
    }
    find_part(root, &|part| is_leaf_of(part, "text/plain"))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), HTML_RENDER_WIDTH) {
        Ok(text) => collapse_whitespace(&text),
        Err(err) => {
            debug!(target: DEBUG, error = %err, "html conversion failed, keeping raw content");
            html.to_string()
        }
    }
}

fn body_text(part: &ParsedMail<'_>) -> Result<String, IngestError> {
    let content = part.get_body()?;
    if part.ctype.mimetype.eq_ignore_ascii_case("text/html") {
        Ok(html_to_text(&content))
    } else {
        Ok(collapse_whitespace(&content))
    }
}

/// `subject + " " + body`, lower-cased and capped at [`EXCERPT_LIMIT`] chars.
pub fn build_excerpt(subject: &str, body: &str) -> String {
    format!("{subject} {body}")
        .to_lowercase()
        .chars()
        .take(EXCERPT_LIMIT)
        .collect()
}

fn header(parsed: &ParsedMail<'_>, name: &str) -> Option<String> {
    parsed
        .headers
        .get_first_value(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_message(raw: &[u8], identifier: &str) -> Result<ParsedMessage, IngestError> {
    let parsed = mailparse::parse_mail(raw)?;

    let message_key = message_key(header(&parsed, "Message-ID").as_deref(), identifier);
    let sender = header(&parsed, "From").and_then(|value| first_token(&value));
    let recipient = header(&parsed, "To").and_then(|value| first_token(&value));
    let in_reply_to = header(&parsed, "In-Reply-To").and_then(|value| first_token(&value));
    let references = header(&parsed, "References")
        .map(|value| extract_tokens(&value))
        .unwrap_or_default();
    let subject = header(&parsed, "Subject");
    let date = header(&parsed, "Date")
        .map(|value| parse_date(&value))
        .transpose()?;
    let cc = header(&parsed, "Cc");
    let bcc = header(&parsed, "Bcc");

    let body = select_body(&parsed).ok_or(IngestError::MissingBody)?;
    let text = body_text(body)?;
    let excerpt = build_excerpt(subject.as_deref().unwrap_or_default(), &text);

    Ok(ParsedMessage {
        message_key,
        sender,
        recipient,
        in_reply_to,
        references,
        subject,
        date,
        cc,
        bcc,
        excerpt,
    })
}
