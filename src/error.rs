use std::io;

use rendezvous_punch_core::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("rendezvous store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<rendezvous_punch_core::error::Error> for Error {
    fn from(value: rendezvous_punch_core::error::Error) -> Self {
        use rendezvous_punch_core::error::Error as CoreError;
        match value {
            CoreError::Io(e) => Error::Io(e),
            CoreError::Timeout => Error::Io(io::Error::from(io::ErrorKind::TimedOut)),
            e => Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
