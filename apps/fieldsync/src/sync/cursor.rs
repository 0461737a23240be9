//! Pull cursor tokens
//!
//! A cursor is an opaque position in the change feed. It wraps the last
//! delivered change sequence number so clients cannot do arithmetic on it.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::error::AppError;

const PREFIX: &str = "seq:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Cursor(i64);

impl Cursor {
    /// Position before any change
    pub fn start() -> Self {
        Cursor(0)
    }

    pub fn at(seq: i64) -> Self {
        Cursor(seq)
    }

    pub fn seq(&self) -> i64 {
        self.0
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}{}", PREFIX, self.0))
    }

    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| CursorError(token.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|_| CursorError(token.to_string()))?;

        text.strip_prefix(PREFIX)
            .and_then(|seq| seq.parse::<i64>().ok())
            .filter(|seq| *seq >= 0)
            .map(Cursor)
            .ok_or_else(|| CursorError(token.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid cursor: {0}")]
pub struct CursorError(String);

impl From<CursorError> for AppError {
    fn from(e: CursorError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}
