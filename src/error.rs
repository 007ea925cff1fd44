use std::io;
use std::result;

use thiserror::Error;

use crate::constants::Pgno;

/// Custom result type for embedb operations
pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced by the storage engine and the embedding store.
///
/// A missing key is never an error: lookups return `Ok(None)` and deletes
/// return `Ok(false)`.
#[derive(Error, Debug)]
pub enum Error {
    /// The map cannot hold another page
    #[error("environment map size limit reached")]
    OutOfSpace,
    /// A page failed its number or checksum validation
    #[error("page {pgno} is corrupted")]
    CorruptPage { pgno: Pgno },
    /// Another write transaction is active
    #[error("another write transaction is active")]
    WriteConflict,
    /// Underlying storage failure
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Key/data pair already exists
    #[error("key/data pair already exists")]
    KeyExist,
    /// Unsupported size of key
    #[error("unsupported key size {0}")]
    BadValSize(usize),
    /// Transaction hit an error and must be aborted
    #[error("transaction must abort")]
    BadTxn,
    /// Object used after its transaction finished
    #[error("transaction is no longer active")]
    InvalidState,
    /// Environment is read-only
    #[error("environment is read-only")]
    ReadOnly,
    /// Environment maxreaders limit reached
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    /// File is not a valid embedb file
    #[error("file is not a valid embedb file")]
    Invalid,
    /// Database version mismatch
    #[error("database format version mismatch: found {0}")]
    VersionMismatch(u32),
    /// Flag cannot be changed on an open environment
    #[error("environment flag cannot be changed after open")]
    FlagsImmutable,
    /// Environment map size is invalid
    #[error("invalid map size {0}")]
    InvalidMapSize(usize),
    /// Stored bytes could not be decoded by the store codec
    #[error("cannot decode value: {0}")]
    Decode(String),
}

impl Error {
    /// Storage failures that leave the file suspect rather than the caller
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::OutOfSpace | Error::CorruptPage { .. } | Error::Io(_)
        )
    }
}
