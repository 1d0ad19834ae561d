//! General utilities shared across the application.

use rand::Rng;

use crate::protocol_constants::ROOM_TOKEN_LEN;

// ─────────────────────────────────────────────────────────────────────────────
// Room Tokens
// ─────────────────────────────────────────────────────────────────────────────

/// Alphabet for generated room tokens.
///
/// Uppercase alphanumeric without confusable characters (0, O, I, 1) so
/// tokens survive being read aloud or retyped from a screenshot.
const TOKEN_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generates a fresh room token.
///
/// Tokens are short uppercase identifiers; uniqueness is the caller's
/// responsibility (check against the registry and retry on collision).
#[must_use]
pub fn generate_room_token() -> String {
    let mut rng = rand::rng();
    (0..ROOM_TOKEN_LEN)
        .map(|_| TOKEN_CHARS[rng.random_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

/// Checks whether a client-supplied room id is acceptable.
///
/// Room ids arrive via the URL path; anything beyond short ASCII
/// alphanumerics is rejected before it can become a registry key.
#[must_use]
pub fn is_valid_room_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 16
        && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

// ─────────────────────────────────────────────────────────────────────────────
// Time Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `stamp` (a monotonic instant, 0 = never) lies within `window`
/// seconds before `now`.
#[must_use]
pub fn within_window(now: f64, stamp: f64, window: f64) -> bool {
    stamp > 0.0 && now - stamp < window
}
