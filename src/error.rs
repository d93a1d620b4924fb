use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Protocol and store errors. The wire-visible variants map one to one
/// onto the nack discipline: `Parse` drops silently, `Signature` nacks,
/// `Rejected` poisons acceptance, `Refused` aborts without penalty.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed packet: {0}")]
    Parse(String),
    #[error("signature or box authentication failed")]
    Signature,
    #[error("no live transaction for ti {0}")]
    UnknownTransaction(u32),
    #[error("remote '{0}' is not joined")]
    Unjoined(String),
    #[error("remote '{0}' is not allowed")]
    Unallowed(String),
    #[error("identity rejected for role '{0}'")]
    Rejected(String),
    #[error("refused")]
    Refused,
    #[error("correspondent demands vacuous rejoin")]
    Renew,
    #[error("transaction deadline expired")]
    Timeout,
    #[error("segment count {0} exceeds limit")]
    Overflow(u32),
    #[error("no remote with uid {0}")]
    UnknownRemote(u32),
    #[error("duplicate remote '{0}'")]
    Duplicate(String),
    #[error("keep io: {0}")]
    Keep(#[from] io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Parse(err.to_string())
    }
}
