use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// NebDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A cell with the same hash is already present in the trunk index.
    AlreadyExists,
    /// The hash is absent from the trunk index.
    NotFound,
    /// The schema id or name is not registered in the schema table.
    SchemaNotFound(String),
    /// No segment in the trunk can satisfy the allocation.
    StoreFull,
    /// Header plus body exceeds the segment size. Carries the requested size.
    ObjectTooLarge(usize),
    /// Replica data inconsistent with its declared bounds during recovery.
    CorruptReplica(String),
    /// A value does not conform to the schema field it is written against.
    TypeMismatch(String),
    /// No update function is registered under the symbol.
    FunctionNotFound(String),
    /// Invalid data, typically decoding errors, corruption, or unexpected internal values.
    InvalidData(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::AlreadyExists => write!(f, "cell already exists"),
            Error::NotFound => write!(f, "cell not found"),
            Error::SchemaNotFound(which) => write!(f, "schema not found: {which}"),
            Error::StoreFull => write!(f, "no segment can satisfy the allocation"),
            Error::ObjectTooLarge(size) => {
                write!(f, "cell of {size} bytes exceeds the segment size")
            }
            Error::CorruptReplica(msg) => write!(f, "corrupt replica: {msg}"),
            Error::TypeMismatch(msg) => write!(f, "value does not match schema: {msg}"),
            Error::FunctionNotFound(sym) => write!(f, "no update function registered as {sym}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// A NebDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
