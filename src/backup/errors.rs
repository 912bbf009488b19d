//! Statement-dump error types
//!
//! Error codes:
//! - BK_IO (ERROR): reading or writing the dump file failed
//! - BK_NOT_FOUND (ERROR): the dump file does not exist
//! - BK_CORRUPT (ERROR): bad magic, version, section or inflate failure
//! - BK_WRONG_KEY (ERROR): the key check in the header did not match
//! - BK_DATABASE (ERROR): the source or destination connection failed
//! - BK_RELEASED (ERROR): the kit was already run or released
//!
//! None of these touch the source database. A failed dump leaves at most a
//! partial output file behind.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation failed but nothing else is affected
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupErrorCode {
    BkIo,
    BkNotFound,
    BkCorrupt,
    BkWrongKey,
    BkDatabase,
    BkReleased,
}

impl BackupErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupErrorCode::BkIo => "BK_IO",
            BackupErrorCode::BkNotFound => "BK_NOT_FOUND",
            BackupErrorCode::BkCorrupt => "BK_CORRUPT",
            BackupErrorCode::BkWrongKey => "BK_WRONG_KEY",
            BackupErrorCode::BkDatabase => "BK_DATABASE",
            BackupErrorCode::BkReleased => "BK_RELEASED",
        }
    }

    pub fn severity(&self) -> Severity {
        Severity::Error
    }
}

impl fmt::Display for BackupErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
pub struct BackupError {
    code: BackupErrorCode,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl BackupError {
    fn new(code: BackupErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(BackupErrorCode::BkIo, message).with_source(source)
    }

    /// Open failure at `path`; a missing file gets its own code.
    pub fn open(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::new(
                BackupErrorCode::BkNotFound,
                format!("{} does not exist", path.display()),
            )
        } else {
            Self::io(format!("open {}", path.display()), source)
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::BkCorrupt, message)
    }

    pub fn wrong_key(message: impl Into<String>) -> Self {
        Self::new(BackupErrorCode::BkWrongKey, message)
    }

    pub fn database(message: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::new(BackupErrorCode::BkDatabase, message).with_source(source)
    }

    pub fn released(what: &str) -> Self {
        Self::new(BackupErrorCode::BkReleased, format!("{} already released", what))
    }

    pub fn code(&self) -> BackupErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code.severity(), self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl StdError for BackupError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

pub type BackupResult<T> = Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_has_its_own_code() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err = BackupError::open(Path::new("/x/dump"), missing);
        assert_eq!(err.code(), BackupErrorCode::BkNotFound);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        let err = BackupError::open(Path::new("/x/dump"), denied);
        assert_eq!(err.code(), BackupErrorCode::BkIo);
    }

    #[test]
    fn test_display_contains_code_and_cause() {
        let err = BackupError::io("write section", io::Error::new(io::ErrorKind::Other, "disk full"));
        let display = err.to_string();
        assert!(display.contains("[ERROR] BK_IO"));
        assert!(display.contains("caused by: disk full"));
    }
}
