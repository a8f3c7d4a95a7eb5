//! Opaque pagination tokens.
//!
//! A token is URL-safe base64 over a small JSON document binding the resume
//! position to a fingerprint of the query text, so a token can only resume
//! the query that produced it.

use std::hash::Hasher;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

use crate::query::errors::SemanticError;
use crate::query::value::Value;

const CURSOR_VERSION: u8 = 1;

/// Largest row offset a token may carry.
pub const MAX_OFFSET_ROWS: u64 = 1 << 48;

/// Fingerprint of the query text a cursor belongs to.
pub fn query_fingerprint(query: &str) -> u64 {
    let mut hasher = Xxh64::new(0);
    hasher.write(query.trim().as_bytes());
    hasher.finish()
}

/// Where the next page starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// Strictly after the row with these sort values and tiebreak.
    After {
        /// Sort key values of the last returned row.
        sort_values: Vec<Value>,
        /// Unique tiebreak of the last returned row.
        tiebreak: Value,
    },
    /// After this many rows of the ordered output.
    Offset {
        /// Rows already consumed.
        rows: u64,
    },
}

/// Decoded cursor.
#[derive(Clone, Debug, PartialEq)]
pub struct Cursor {
    /// Fingerprint of the originating query.
    pub query_hash: u64,
    /// Resume position.
    pub anchor: Anchor,
}

#[derive(Serialize, Deserialize)]
struct Token {
    v: u8,
    q: String,
    a: Anchor,
}

fn invalid(reason: impl Into<String>) -> SemanticError {
    SemanticError::InvalidCursor {
        reason: reason.into(),
    }
}

impl Cursor {
    /// Cursor for `query` resuming at `anchor`.
    pub fn new(query: &str, anchor: Anchor) -> Self {
        Self {
            query_hash: query_fingerprint(query),
            anchor,
        }
    }

    /// Opaque token.
    pub fn encode(&self) -> String {
        let token = Token {
            v: CURSOR_VERSION,
            q: format!("{:016x}", self.query_hash),
            a: self.anchor.clone(),
        };
        // Serializing plain data into a Vec cannot fail.
        let json = serde_json::to_vec(&token).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes `token` and checks it belongs to `query`.
    pub fn decode(token: &str, query: &str) -> Result<Self, SemanticError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|err| invalid(format!("not a cursor token ({err})")))?;
        let token: Token = serde_json::from_slice(&bytes)
            .map_err(|err| invalid(format!("malformed cursor ({err})")))?;
        if token.v != CURSOR_VERSION {
            return Err(invalid(format!("unsupported cursor version {}", token.v)));
        }
        let query_hash = u64::from_str_radix(&token.q, 16)
            .map_err(|_| invalid("malformed query fingerprint"))?;
        if query_hash != query_fingerprint(query) {
            return Err(invalid("cursor belongs to a different query"));
        }
        if let Anchor::Offset { rows } = token.a {
            if rows > MAX_OFFSET_ROWS {
                return Err(invalid(format!("offset {rows} out of range")));
            }
        }
        Ok(Self {
            query_hash,
            anchor: token.a,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY: &str = "FOR u IN users SORT u.age RETURN u";

    #[test]
    fn token_resumes_its_own_query() {
        let cursor = Cursor::new(
            QUERY,
            Anchor::After {
                sort_values: vec![Value::Int(31)],
                tiebreak: Value::from("u7"),
            },
        );
        let decoded = Cursor::decode(&cursor.encode(), QUERY).expect("decode");
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn token_for_another_query_is_rejected() {
        let token = Cursor::new(QUERY, Anchor::Offset { rows: 10 }).encode();
        let err = Cursor::decode(&token, "FOR u IN users RETURN u").expect_err("mismatch");
        assert_eq!(err.code(), "INVALID_CURSOR");
    }

    #[test]
    fn oversized_offset_is_rejected() {
        let token = Cursor::new(QUERY, Anchor::Offset { rows: u64::MAX }).encode();
        let err = Cursor::decode(&token, QUERY).expect_err("offset bound");
        assert_eq!(err.code(), "INVALID_CURSOR");

        let edge = Cursor::new(QUERY, Anchor::Offset { rows: MAX_OFFSET_ROWS }).encode();
        assert!(Cursor::decode(&edge, QUERY).is_ok());
    }

    #[test]
    fn garbage_is_rejected() {
        for token in ["", "%%%", "bm90IGpzb24"] {
            assert!(matches!(
                Cursor::decode(token, QUERY),
                Err(SemanticError::InvalidCursor { .. })
            ));
        }
    }
}
