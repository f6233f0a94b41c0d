//! Pickup codes.
//!
//! A code is `RES-` followed by three groups of four Crockford base32 symbols,
//! e.g. `RES-7K2M-9QXD-H4PA`. The alphabet has no I, L, O or U, so a code read
//! aloud or typed by hand survives the usual confusions.

use chrono::{DateTime, Utc};
use rand::Rng;
use shared::{QrToken, TokenStatus};
use uuid::Uuid;

const PREFIX: &str = "RES";
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const GROUPS: usize = 3;
const GROUP_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenIssuer;

impl TokenIssuer {
    pub fn new() -> Self {
        Self
    }

    /// Draws a fresh code: 60 bits from the thread-local CSPRNG.
    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let mut code = String::with_capacity(PREFIX.len() + GROUPS * (GROUP_LEN + 1));
        code.push_str(PREFIX);
        for _ in 0..GROUPS {
            code.push('-');
            for _ in 0..GROUP_LEN {
                code.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
            }
        }
        code
    }

    /// A new ACTIVE token bound to `reservation_id`, expiring with it.
    pub fn mint(&self, reservation_id: Uuid, expires_at: DateTime<Utc>) -> QrToken {
        QrToken {
            token: self.generate(),
            reservation_id,
            status: TokenStatus::Active,
            expires_at,
            used_at: None,
            used_by: None,
        }
    }
}

/// Canonical form of a scanned or hand-typed code. Returns `None` when nothing
/// is left after cleanup.
pub fn normalize(input: &str) -> Option<String> {
    let compact: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if compact.is_empty() {
        return None;
    }

    let Some(body) = compact.strip_prefix(PREFIX) else {
        return Some(compact);
    };
    let body: String = body
        .trim_start_matches('-')
        .chars()
        .filter(|c| *c != '-')
        .map(|c| match c {
            'O' => '0',
            'I' | 'L' => '1',
            other => other,
        })
        .collect();
    if body.len() != GROUPS * GROUP_LEN {
        return Some(compact);
    }

    let mut code = String::from(PREFIX);
    for (i, c) in body.chars().enumerate() {
        if i % GROUP_LEN == 0 {
            code.push('-');
        }
        code.push(c);
    }
    Some(code)
}
