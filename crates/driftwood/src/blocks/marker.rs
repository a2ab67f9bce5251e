//! Wire grammar of the completion marker.
//!
//! A cooperating shell prompt emits `<<<MARKER>>>:` followed by an optional
//! `-`, one or more ASCII digits, and exactly one space. The parser must
//! behave identically however the bytes are split across chunks, so "ends
//! before the terminator" means *need more data*, never *invalid*.

/// Literal prefix the prompt hook writes in front of the exit status.
pub const MARKER_PREFIX: &str = "<<<MARKER>>>:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MarkerParse {
    /// A full marker: the exit status and the bytes it occupied.
    Complete { exit_code: i32, consumed: usize },
    /// The buffer ends inside the marker; retain it and wait.
    NeedMore,
    /// The prefix is not followed by a valid status; demote one byte.
    Invalid,
}

/// Parses a marker assumed to start at the beginning of `buf`.
pub(crate) fn parse_marker(buf: &[u8]) -> MarkerParse {
    let prefix = MARKER_PREFIX.as_bytes();
    debug_assert!(buf.starts_with(prefix) || buf.len() < prefix.len());
    let mut index = prefix.len();
    if index >= buf.len() {
        return MarkerParse::NeedMore;
    }
    if buf[index] == b'-' {
        index += 1;
    }
    let digits_start = index;
    while index < buf.len() && buf[index].is_ascii_digit() {
        index += 1;
    }
    if index == digits_start {
        return if index >= buf.len() {
            MarkerParse::NeedMore
        } else {
            MarkerParse::Invalid
        };
    }
    if index >= buf.len() {
        return MarkerParse::NeedMore;
    }
    if buf[index] != b' ' {
        return MarkerParse::Invalid;
    }
    let digits = &buf[prefix.len()..index];
    match std::str::from_utf8(digits).ok().and_then(|text| text.parse::<i32>().ok()) {
        Some(exit_code) => MarkerParse::Complete {
            exit_code,
            consumed: index + 1,
        },
        None => MarkerParse::Invalid,
    }
}

/// First position where the marker prefix occurs in `buf`.
pub(crate) fn find_prefix(buf: &[u8]) -> Option<usize> {
    let prefix = MARKER_PREFIX.as_bytes();
    if buf.len() < prefix.len() {
        return None;
    }
    buf.windows(prefix.len())
        .position(|window| window == prefix)
}

/// Length of the longest buffer suffix that could still grow into the
/// prefix; those bytes must not be flushed as output.
pub(crate) fn partial_prefix_len(buf: &[u8]) -> usize {
    let prefix = MARKER_PREFIX.as_bytes();
    let max = buf.len().min(prefix.len() - 1);
    for keep in (1..=max).rev() {
        if buf[buf.len() - keep..] == prefix[..keep] {
            return keep;
        }
    }
    0
}
