use std::fmt;

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
#[derive(Debug)]
pub struct Error {
    inner: ErrorKind,
}

impl Error {
    pub(crate) fn from(e: impl Into<ErrorKind>) -> Self {
        Self { inner: e.into() }
    }

    /// Returns the D-Bus error name if this error was returned by the remote end of a method call.
    ///
    /// Transport failures, timeouts and local errors return [`None`].
    pub fn remote_name(&self) -> Option<&str> {
        match &self.inner {
            ErrorKind::Zbus(zbus::Error::MethodError(name, _, _)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Returns the human-readable message attached to this error.
    ///
    /// For remote method errors this is the message sent by the remote end (or the error name if
    /// none was sent), for everything else it's the [`Display`](fmt::Display) output.
    pub fn message(&self) -> String {
        match &self.inner {
            ErrorKind::Zbus(zbus::Error::MethodError(name, msg, _)) => match msg {
                Some(msg) => msg.clone(),
                None => name.to_string(),
            },
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorKind::Zbus(e) => e.fmt(f),
            ErrorKind::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Zbus(zbus::Error),
    Other(String),
}

impl From<zbus::Error> for ErrorKind {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<Error> for ErrorKind {
    fn from(value: Error) -> Self {
        value.inner
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}
