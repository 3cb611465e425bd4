use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Cinder errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A component snapshot (save slot, chapter index page, volume-index
    /// image) failed structural validation.
    CorruptComponent(String),
    /// Decoded data was internally inconsistent.
    CorruptData(String),
    /// The superblock or region table of the backing file is unusable.
    CorruptFile(String),
    /// No valid save slot exists; the caller may rebuild instead.
    NotSavedCleanly,
    /// A read returned fewer bytes than the on-disk format requires.
    ShortRead(String),
    /// A read ran off the end of the backing file or region.
    EndOfFile,
    /// An access fell outside the bounds of a region or window.
    OutOfRange(String),
    /// A delta list is full. The write that hit this is dropped silently
    /// by the index; it is surfaced only between internal layers.
    Overflow,
    /// A name was inserted twice into the same chapter index.
    DuplicateName,
    /// An operation was attempted in a state that does not permit it.
    BadState(String),
    /// Invalid caller-supplied input.
    InvalidArgument(String),
    /// The index has been poisoned by a chapter-write failure and no
    /// longer accepts writes.
    Disabled,
    /// The session has no open index.
    NoIndex,
    /// The operation conflicts with a suspend or shutdown in progress.
    Busy,
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CorruptComponent(msg) => write!(f, "corrupt component: {msg}"),
            Error::CorruptData(msg) => write!(f, "corrupt data: {msg}"),
            Error::CorruptFile(msg) => write!(f, "corrupt file: {msg}"),
            Error::NotSavedCleanly => write!(f, "index not saved cleanly"),
            Error::ShortRead(msg) => write!(f, "short read: {msg}"),
            Error::EndOfFile => write!(f, "unexpected end of file"),
            Error::OutOfRange(msg) => write!(f, "out of range: {msg}"),
            Error::Overflow => write!(f, "delta list overflow"),
            Error::DuplicateName => write!(f, "duplicate name in chapter"),
            Error::BadState(msg) => write!(f, "bad state: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Disabled => write!(f, "index is disabled"),
            Error::NoIndex => write!(f, "no index open"),
            Error::Busy => write!(f, "index is busy"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::CorruptData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::CorruptData(format!($($args)*)) };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

/// Constructs an Error::BadState for the given format string.
#[macro_export]
macro_rules! errstate {
    ($($args:tt)*) => { $crate::error::Error::BadState(format!($($args)*)) };
}

/// A Cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::EndOfFile,
            _ => Error::IO(err.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
