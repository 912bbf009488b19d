//! Repair error types
//!
//! Error codes:
//! - RK_OPEN_FAILED (ERROR): the corrupted source cannot be opened at all
//! - RK_MATERIAL_NOT_FOUND (ERROR): backup material file is missing
//! - RK_MATERIAL_CORRUPT (ERROR): backup material failed magic/CRC/inflate
//! - RK_MATERIAL_WRONG_KEY (ERROR): backup material key check failed
//! - RK_MATERIAL_INVALID (ERROR): schema cannot be represented in material
//! - RK_IO (ERROR): other file I/O failure
//! - RK_DATABASE (ERROR): a live or destination database call failed
//! - RK_CANCELED (INFO): the operation was canceled
//! - RK_RELEASED (ERROR): the object was already released

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Expected stop, not a fault
    Info,
    /// Operation fails
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairErrorCode {
    RkOpenFailed,
    RkMaterialNotFound,
    RkMaterialCorrupt,
    RkMaterialWrongKey,
    RkMaterialInvalid,
    RkIo,
    RkDatabase,
    RkCanceled,
    RkReleased,
}

impl RepairErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            RepairErrorCode::RkOpenFailed => "RK_OPEN_FAILED",
            RepairErrorCode::RkMaterialNotFound => "RK_MATERIAL_NOT_FOUND",
            RepairErrorCode::RkMaterialCorrupt => "RK_MATERIAL_CORRUPT",
            RepairErrorCode::RkMaterialWrongKey => "RK_MATERIAL_WRONG_KEY",
            RepairErrorCode::RkMaterialInvalid => "RK_MATERIAL_INVALID",
            RepairErrorCode::RkIo => "RK_IO",
            RepairErrorCode::RkDatabase => "RK_DATABASE",
            RepairErrorCode::RkCanceled => "RK_CANCELED",
            RepairErrorCode::RkReleased => "RK_RELEASED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            RepairErrorCode::RkCanceled => Severity::Info,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for RepairErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug)]
pub struct RepairError {
    code: RepairErrorCode,
    message: String,
    details: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl RepairError {
    fn new(code: RepairErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn open_failed(message: impl Into<String>, source: crate::pager::PagerError) -> Self {
        let details = source.code().code().to_string();
        Self::new(RepairErrorCode::RkOpenFailed, message)
            .with_details(details)
            .with_source(source)
    }

    pub fn material_not_found(path: &std::path::Path) -> Self {
        Self::new(RepairErrorCode::RkMaterialNotFound, "backup material not found")
            .with_details(format!("path: {}", path.display()))
    }

    pub fn material_corrupt(message: impl Into<String>) -> Self {
        Self::new(RepairErrorCode::RkMaterialCorrupt, message)
    }

    pub fn material_wrong_key(message: impl Into<String>) -> Self {
        Self::new(RepairErrorCode::RkMaterialWrongKey, message)
    }

    pub fn material_invalid(message: impl Into<String>) -> Self {
        Self::new(RepairErrorCode::RkMaterialInvalid, message)
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::new(RepairErrorCode::RkIo, message).with_source(source)
    }

    pub fn database(message: impl Into<String>, source: rusqlite::Error) -> Self {
        let details = source.to_string();
        Self::new(RepairErrorCode::RkDatabase, message)
            .with_details(details)
            .with_source(source)
    }

    pub fn canceled() -> Self {
        Self::new(RepairErrorCode::RkCanceled, "operation canceled")
    }

    pub fn released(what: &str) -> Self {
        Self::new(RepairErrorCode::RkReleased, format!("{} already released", what))
    }

    pub fn code(&self) -> RepairErrorCode {
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

    pub fn is_canceled(&self) -> bool {
        self.code == RepairErrorCode::RkCanceled
    }
}

impl fmt::Display for RepairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity(), self.code.code(), self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl StdError for RepairError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

pub type RepairResult<T> = Result<T, RepairError>;
