//! Custom error types for the parsing and lookup of Tor documents

use std::num::ParseIntError;
use std::path::PathBuf;
use std::string::ToString;

use thiserror;

use crate::annotation::Annotation;

/// Error that occured when parsing the fields of a single Tor document.
///
/// Inside a [`RecordStream`](crate::records::RecordStream) these errors are
/// attached to the affected record and do not stop the iteration.
#[derive(thiserror::Error, Debug)]
pub enum DocumentParseError {
    #[error("an internal parsing error occured (raised by nom)")]
    Internal(#[from] nom::error::Error<String>),
    #[error("Parsing stopped after {index} characters before input was complete (line {line}, character {character})")]
    InputRemaining {
        index: usize,
        line: usize,
        character: usize,
    },
    #[error("When parsing a document, not all necessary information were present")]
    Incomplete(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("An item with keyword '{keyword}' unexpectedly had no or not enough arguments")]
    ItemArgumentsMissing { keyword: String },
    #[error("Mandatory item '{keyword}' is missing")]
    ItemMissing { keyword: String },
    #[error("Could not decode string as base64")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("Invalid fingerprint '{raw}'")]
    InvalidFingerprint { raw: String },
    #[error("Document is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Could not parse date/time")]
    InvalidDate(#[from] chrono::format::ParseError),
    #[error("Could not parse integer in {context}")]
    InvalidInt { context: String },
    #[error("Unknown flag '{flag}'")]
    UnknownFlag { flag: String },
    #[error("Invalid bandwidth weight entry")]
    InvalidBandwidthWeight,
    #[error("Content range '{from}'...'{to}' not found")]
    ContentRangeNotFound { from: String, to: String },
    #[error("Invalid IP address of relay: {0}")]
    InvalidIpAddress(String),
}

impl DocumentParseError {
    /// Create a new error of variant `InputRemaining`, based on the
    /// observed parser inputs.
    pub(crate) fn remaining(total_input: &str, remaining_input: &str) -> DocumentParseError {
        let consumed = total_input.len().saturating_sub(remaining_input.len());
        let line = total_input[..consumed].matches('\n').count() + 1;
        let character = match total_input[..consumed].rfind('\n') {
            Some(index) => consumed - index,
            None => consumed + 1,
        };
        DocumentParseError::InputRemaining {
            index: consumed,
            line,
            character,
        }
    }

    /// Create a new ItemArgumentsMissing error, easily
    pub fn args_missing(keyword: impl Into<String>) -> DocumentParseError {
        DocumentParseError::ItemArgumentsMissing {
            keyword: keyword.into(),
        }
    }
}

/// Error concerning the `@type` annotation in the first line of a document
#[derive(thiserror::Error, Debug)]
pub enum AnnotationError {
    #[error("Malformed type annotation {line:?}")]
    Malformed { line: String },
    #[error("Type annotation line is longer than {limit} bytes")]
    TooLong { limit: usize },
    #[error("Annotation '{annotation}' is not accepted as {expected}")]
    NotAccepted {
        annotation: Annotation,
        expected: String,
    },
    #[error("Could not read type annotation")]
    Io(#[from] std::io::Error),
}

/// Error that breaks the framing of a record stream.
///
/// Once returned, the stream yields no further records.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Object '{keyword}' opened in line {line} is never terminated")]
    UnterminatedObject { keyword: String, line: usize },
    #[error("Line {line} starts with keyword '{keyword}' where a new record was expected")]
    UnexpectedKeyword { keyword: String, line: usize },
    #[error("Could not read from document stream")]
    Io(#[from] std::io::Error),
}

/// Error when parsing a whole document file
#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Parse(#[from] DocumentParseError),
}

/// Error when looking up documents in an archive
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("No descriptor with digest {digest} found (searched {searched:?})")]
    NotFound {
        digest: String,
        searched: Vec<PathBuf>,
    },
    #[error("Could not read archive file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Archive file has an unexpected type annotation")]
    Annotation(#[from] AnnotationError),
    #[error("Archive file is malformed")]
    Stream(#[from] StreamError),
}

pub(crate) trait ErrorContext<T> {
    type IntoError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError>;
}

impl<T> ErrorContext<T> for Result<T, ParseIntError> {
    type IntoError = DocumentParseError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError> {
        self.map_err(|_| DocumentParseError::InvalidInt {
            context: context.to_string(),
        })
    }
}
