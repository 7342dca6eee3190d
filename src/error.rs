use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested key or file does not exist.
    NotFound,
    /// On-disk data failed validation: bad checksum, truncated record,
    /// unknown tag, or a file the manifest refers to is missing.
    Corruption(String),
    /// Invalid caller input or an invalid database configuration.
    InvalidArgument(String),
    /// An IO error from the environment.
    Io(String),
    /// The operation is not supported by this build.
    NotSupported(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption from the given format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
