use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("aborting: {0}")]
    Abort(String),

    #[error("missing file {}", .0.display())]
    MissingFile(PathBuf),

    #[error("missing directory {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("invalid hash text {0:?}")]
    BadHashText(String),

    #[error("bad hash for {name} (got {actual}, expected {expected})")]
    Integrity {
        name: String,
        actual: String,
        expected: String,
    },

    #[error("signature failure for {name} using signature {sig_name}")]
    Signature { name: String, sig_name: String },

    #[error("failed to download {name}: {reason}")]
    Download { name: String, reason: String },

    #[error("git error: {0}")]
    Git(String),

    #[error("unexpected archive member {0}")]
    UnexpectedArchiveMember(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

impl Error {
    pub fn usage(message: impl Into<String>) -> Self {
        Error::Usage(message.into())
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Error::Abort(message.into())
    }

    pub fn download(name: impl Into<String>, reason: impl ToString) -> Self {
        Error::Download {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the failure kinds that cached/assume-ok fallbacks are allowed
    /// to swallow before attempting a fresh fetch.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::MissingFile(_)
                | Error::BadHashText(_)
                | Error::Integrity { .. }
                | Error::Signature { .. }
        )
    }
}
