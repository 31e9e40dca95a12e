use object::{read, write};
use std::{error, fmt, io};

/// An error that occurred while copying a file.
#[derive(Debug)]
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Io(io::Error),
    Parse(read::Error),
    Write(write::Error),
    Config(String),
    Note(String),
}

/// The kind of error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A parse error occurred while reading the file.
    Parse,
    /// A validation error occurred while writing the file.
    Write,
    /// An I/O error occurred while writing the file.
    Io(io::ErrorKind),
    /// The configured rules are inconsistent.
    ///
    /// Configuration errors abort the whole run.
    Config,
    /// A build attribute note stream is malformed.
    Note,
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Io(e) => e.fmt(f),
            ErrorInner::Parse(e) => e.fmt(f),
            ErrorInner::Write(e) => e.fmt(f),
            ErrorInner::Config(e) => e.fmt(f),
            ErrorInner::Note(e) => write!(f, "corrupt build attribute notes: {}", e),
        }
    }
}

impl error::Error for Error {}

impl Error {
    /// Get the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Io(e) => ErrorKind::Io(e.kind()),
            ErrorInner::Parse(_) => ErrorKind::Parse,
            ErrorInner::Write(_) => ErrorKind::Write,
            ErrorInner::Config(_) => ErrorKind::Config,
            ErrorInner::Note(_) => ErrorKind::Note,
        }
    }

    pub(crate) fn io(error: io::Error) -> Self {
        Self {
            inner: ErrorInner::Io(error),
        }
    }

    pub(crate) fn parse(error: read::Error) -> Self {
        Self {
            inner: ErrorInner::Parse(error),
        }
    }

    pub(crate) fn write(error: write::Error) -> Self {
        Self {
            inner: ErrorInner::Write(error),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self {
            inner: ErrorInner::Config(message.into()),
        }
    }

    pub(crate) fn note(message: impl Into<String>) -> Self {
        Self {
            inner: ErrorInner::Note(message.into()),
        }
    }
}

/// The `Result` type for this library.
pub type Result<T> = std::result::Result<T, Error>;
