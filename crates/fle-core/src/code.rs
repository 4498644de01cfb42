//! Session-code format.
//!
//! A session code is three dash-separated segments, `adjective-noun-number`,
//! where the number is an integer in `1..=99`. Codes are case-insensitive and
//! surrounding whitespace is ignored, so `" HAPPY-Panda-42 "` and
//! `"happy-panda-42"` name the same session.

/// Smallest number allowed in the trailing segment.
pub const MIN_CODE_NUMBER: u8 = 1;
/// Largest number allowed in the trailing segment.
pub const MAX_CODE_NUMBER: u8 = 99;

/// Canonical form of a session code: trimmed and lowercased.
///
/// Normalization does not validate; pair it with [`is_valid_session_code`].
pub fn normalize_session_code(code: &str) -> String {
    code.trim().to_lowercase()
}

/// Whether `code` has the `adjective-noun-number` shape.
///
/// The check runs on the normalized form, so case never matters.
pub fn is_valid_session_code(code: &str) -> bool {
    let normalized = normalize_session_code(code);
    if normalized.is_empty() {
        return false;
    }

    let parts: Vec<&str> = normalized.split('-').collect();
    let [adjective, noun, number] = parts.as_slice() else {
        return false;
    };
    if adjective.is_empty() || noun.is_empty() {
        return false;
    }

    parse_code_number(number).is_some()
}

/// Parse the trailing segment: one or two ASCII digits in `1..=99`.
fn parse_code_number(segment: &str) -> Option<u8> {
    if segment.is_empty() || segment.len() > 2 || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u8 = segment.parse().ok()?;
    (MIN_CODE_NUMBER..=MAX_CODE_NUMBER).contains(&n).then_some(n)
}
