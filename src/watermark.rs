use crate::providers::Listing;

/// Position returned when the account has nothing new to fetch.
pub const NO_NEW_MAIL: usize = 0;

/// Computes the 1-based server position to fetch next.
///
/// A watermark missing from the listing (first run, or the server expired it)
/// restarts from position 1. A watermark sitting on the last listed identifier
/// yields [`NO_NEW_MAIL`], as does a successor position past `message_count`.
pub fn next_position(listing: &[Listing], watermark: Option<&str>, message_count: usize) -> usize {
    let Some(watermark) = watermark else {
        return 1;
    };

    let Some(index) = listing
        .iter()
        .position(|entry| entry.identifier == watermark)
    else {
        return 1;
    };

    if index + 1 == listing.len() {
        return NO_NEW_MAIL;
    }

    let next = index + 2;
    if next > message_count {
        NO_NEW_MAIL
    } else {
        next
    }
}

/// Identifier stored at `position` in the listing, if the server reported one.
pub fn identifier_at(listing: &[Listing], position: usize) -> Option<&str> {
    listing
        .iter()
        .find(|entry| entry.position == position)
        .map(|entry| entry.identifier.as_str())
}

/// Messages on the server not yet covered by the watermark.
pub fn unread_remaining(position: usize, message_count: usize) -> usize {
    if position == NO_NEW_MAIL {
        0
    } else {
        message_count.saturating_sub(position - 1)
    }
}
