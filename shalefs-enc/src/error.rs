use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
pub(crate) enum ErrorInner {
    Config(String),
    Limit(&'static str),
    DuplicatedEntry,
    Filter(String),
    Rewrite(String),
    Cancelled,

    Compress(shalefs::compress::Error),
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Config(msg) => write!(f, "invalid configuration: {msg}"),
            ErrorInner::Limit(msg) => write!(f, "{msg}"),
            ErrorInner::DuplicatedEntry => f.pad("duplicated entry names in a directory"),
            ErrorInner::Filter(msg) => write!(f, "filter script failed: {msg}"),
            ErrorInner::Rewrite(msg) => write!(f, "cannot rewrite image: {msg}"),
            ErrorInner::Cancelled => f.pad("cancelled"),
            ErrorInner::Compress(err) => err.fmt(f),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Compress(err) => Some(err),
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<shalefs::compress::Error> for Error {
    #[cold]
    fn from(err: shalefs::compress::Error) -> Self {
        Self(Box::new(ErrorInner::Compress(err)))
    }
}
