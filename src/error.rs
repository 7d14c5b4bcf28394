//! The error taxonomy shared by the cache engine and both protocol codecs.
//!
//! Every variant here corresponds to exactly one row of the error table in
//! the design doc's "Error Handling Design" section; the `Display` impl is
//! the canonical human-readable message, and [`CacheError::text_line`] /
//! [`CacheError::binary_status`] are the two places that message gets
//! projected onto the wire. Keeping both projections next to the enum (and
//! nowhere else) means the text and binary protocols can't drift apart.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("not found")]
    NotFound,

    #[error("not stored")]
    Exists,

    #[error("exists")]
    CasMismatch,

    #[error("bad command line format")]
    KeyTooLarge,

    #[error("object too large")]
    ValueTooLarge,

    #[error("cannot increment or decrement non-numeric value")]
    NotNumeric,

    #[error("bad command line format: {0}")]
    Malformed(String),

    #[error("unknown command")]
    Unknown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// The binary-protocol status code for this error, per the required
    /// opcode/status table. `CasMismatch` intentionally shares 0x0002 with
    /// `Exists`, matching real Memcached.
    pub fn binary_status(&self) -> u16 {
        match self {
            CacheError::NotFound => 0x0001,
            CacheError::Exists => 0x0002,
            CacheError::CasMismatch => 0x0002,
            CacheError::ValueTooLarge => 0x0003,
            CacheError::KeyTooLarge => 0x0004,
            CacheError::Malformed(_) => 0x0004,
            CacheError::NotNumeric => 0x0006,
            CacheError::Unknown => 0x0081,
            CacheError::Internal(_) => 0x0084,
        }
    }

    /// The exact text-protocol response line for this error (sans CRLF).
    pub fn text_line(&self) -> String {
        match self {
            CacheError::NotFound => "NOT_FOUND".to_string(),
            CacheError::Exists => "NOT_STORED".to_string(),
            CacheError::CasMismatch => "EXISTS".to_string(),
            CacheError::KeyTooLarge => "CLIENT_ERROR bad command line format".to_string(),
            CacheError::ValueTooLarge => "SERVER_ERROR object too large".to_string(),
            CacheError::NotNumeric => {
                "CLIENT_ERROR cannot increment or decrement non-numeric value".to_string()
            }
            CacheError::Malformed(msg) => format!("CLIENT_ERROR {msg}"),
            CacheError::Unknown => "ERROR".to_string(),
            CacheError::Internal(msg) => format!("SERVER_ERROR {msg}"),
        }
    }

    /// Body text carried by a binary-protocol error response, UTF-8, no CRLF.
    pub fn binary_body(&self) -> String {
        match self {
            CacheError::NotFound => "Not found".to_string(),
            CacheError::Exists | CacheError::CasMismatch => "Data exists for key".to_string(),
            CacheError::KeyTooLarge | CacheError::Malformed(_) => self.to_string(),
            CacheError::ValueTooLarge => "Too large".to_string(),
            CacheError::NotNumeric => {
                "Cannot increment or decrement non-numeric value".to_string()
            }
            CacheError::Unknown => "Unknown command".to_string(),
            CacheError::Internal(msg) => msg.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_mismatch_shares_exists_status() {
        assert_eq!(CacheError::Exists.binary_status(), CacheError::CasMismatch.binary_status());
    }

    #[test]
    fn text_lines_match_table() {
        assert_eq!(CacheError::NotFound.text_line(), "NOT_FOUND");
        assert_eq!(CacheError::Exists.text_line(), "NOT_STORED");
        assert_eq!(CacheError::CasMismatch.text_line(), "EXISTS");
        assert_eq!(
            CacheError::NotNumeric.text_line(),
            "CLIENT_ERROR cannot increment or decrement non-numeric value"
        );
    }
}
