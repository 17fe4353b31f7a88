//! Error types for Fleece operations.

use std::fmt;

/// Error type for Fleece operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    // Encoder misuse errors
    /// A value was written while the open dictionary expects a key.
    NeedKey,
    /// A key was written (or the dictionary closed) while a value is due.
    NeedValue,
    /// A key was written outside of a dictionary.
    NotWritingDict,
    /// `end_array`/`end_dict` does not match the open container.
    WrongCollection,
    /// `end` was called with containers still open.
    UnclosedCollection,
    /// More than one value was written at the top level.
    MultipleRoots,
    /// A write was attempted after `end`.
    Finalized,
    /// A configuration setter was called after encoding started.
    NotIdle,

    // Value-domain errors
    /// NaN cannot be represented.
    NaNFloat,
    /// A back-pointer distance exceeds the wide 31-bit range.
    PointerTooLarge,

    // JSON bridge errors
    /// Failed to parse JSON input.
    JsonParse(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NeedKey => write!(f, "need a key before this value"),
            Error::NeedValue => write!(f, "need a value after a key"),
            Error::NotWritingDict => write!(f, "not writing a dictionary"),
            Error::WrongCollection => write!(f, "ending wrong type of collection"),
            Error::UnclosedCollection => write!(f, "unclosed array/dict"),
            Error::MultipleRoots => write!(f, "top level must have only one value"),
            Error::Finalized => write!(f, "encoder already finalized"),
            Error::NotIdle => write!(f, "options can only change before encoding starts"),
            Error::NaNFloat => write!(f, "can't write NaN"),
            Error::PointerTooLarge => write!(f, "pointer too large"),
            Error::JsonParse(msg) => write!(f, "JSON parse error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias for Fleece operations.
pub type Result<T> = std::result::Result<T, Error>;
