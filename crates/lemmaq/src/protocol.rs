//! Wire protocol shared with the external analyzer.
//!
//! Requests are single lines: the document, a space, the sentinel token and a
//! newline. The analyzer answers with newline-terminated JSON arrays of token
//! records and eventually echoes a record carrying the sentinel.

use serde::{Deserialize, Serialize};

/// Token appended to every request; its echo ends one response stream.
pub const SENTINEL: &str = "EndOfArticleMarker";

/// Maximum accepted document length in bytes. Longer input is truncated.
pub const DOC_LEN_MAX: usize = 4096;

/// `" " + SENTINEL + "\n"`
pub const REQUEST_SUFFIX_LEN: usize = SENTINEL.len() + 2;

/// Bytes reserved for text in every queue slot.
pub const SLOT_TEXT_CAPACITY: usize = DOC_LEN_MAX + REQUEST_SUFFIX_LEN;

/// Frame an already-truncated document as one analyzer request line.
pub fn frame_request(text: &str) -> String {
    let mut framed = String::with_capacity(text.len() + REQUEST_SUFFIX_LEN);
    framed.push_str(text);
    framed.push(' ');
    framed.push_str(SENTINEL);
    framed.push('\n');
    framed
}

/// One token record of an analyzer response line.
///
/// `text` is optional on the wire so that a record missing it can be reported
/// instead of failing the whole line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Vec<Analysis>>,
}

impl TokenRecord {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            analysis: None,
        }
    }

    pub fn analyzed(text: impl Into<String>, lex: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            analysis: Some(vec![Analysis {
                lex: Some(lex.into()),
            }]),
        }
    }
}

/// One candidate analysis of a token. Only the lemma is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lex: Option<String>,
}
