//! Pager error types
//!
//! Error codes:
//! - PG_IO (ERROR severity)
//! - PG_NOT_A_DATABASE (ERROR severity)
//! - PG_WRONG_KEY (ERROR severity)
//! - PG_INVALID_CIPHER (ERROR severity)
//! - PG_PAGE_OUT_OF_RANGE (WARN severity)
//!
//! Structural damage inside a page is not an error at this level; it is
//! reported as a [`PageDamage`](super::PageDamage) reason and tolerated by
//! callers.

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Tolerated, the pass continues
    Warn,
    /// The operation fails
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warn => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerErrorCode {
    /// Read failure on the source file
    PgIo,
    /// File too short or not a paged database
    PgNotADatabase,
    /// Page 1 did not decode with any available key/salt
    PgWrongKey,
    /// Cipher parameters cannot describe a database page
    PgInvalidCipher,
    /// Page number outside the file
    PgPageOutOfRange,
}

impl PagerErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            PagerErrorCode::PgIo => "PG_IO",
            PagerErrorCode::PgNotADatabase => "PG_NOT_A_DATABASE",
            PagerErrorCode::PgWrongKey => "PG_WRONG_KEY",
            PagerErrorCode::PgInvalidCipher => "PG_INVALID_CIPHER",
            PagerErrorCode::PgPageOutOfRange => "PG_PAGE_OUT_OF_RANGE",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PagerErrorCode::PgPageOutOfRange => Severity::Warn,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for PagerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct PagerError {
    code: PagerErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl PagerError {
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code: PagerErrorCode::PgIo,
            message: message.into(),
            details: None,
            source: Some(source),
        }
    }

    pub fn not_a_database(message: impl Into<String>) -> Self {
        Self {
            code: PagerErrorCode::PgNotADatabase,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn wrong_key(message: impl Into<String>) -> Self {
        Self {
            code: PagerErrorCode::PgWrongKey,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn invalid_cipher(message: impl Into<String>) -> Self {
        Self {
            code: PagerErrorCode::PgInvalidCipher,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    pub fn page_out_of_range(page: u32, page_count: u32) -> Self {
        Self {
            code: PagerErrorCode::PgPageOutOfRange,
            message: "page number outside the file".to_string(),
            details: Some(format!("page: {}, page_count: {}", page, page_count)),
            source: None,
        }
    }

    pub fn code(&self) -> PagerErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

impl fmt::Display for PagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code.code(), self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for PagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type PagerResult<T> = Result<T, PagerError>;
