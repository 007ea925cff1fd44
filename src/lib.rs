// src/lib.rs
//! Embedded key/value storage for embedding vectors.
//!
//! A single data file holds a copy-on-write B+tree of byte keys and byte
//! values, read through a memory map. Any number of read transactions run
//! against consistent snapshots while one write transaction prepares the
//! next version; a commit becomes visible atomically and survives crashes.
//! [`EmbeddingStore`] layers string keys and vector encoding on top.

mod btree;
mod constants;
mod cursor;
mod embedding;
mod env;
mod error;
mod freelist;
mod meta;
mod midl;
mod node;
mod page;
mod pager;
mod transaction;
mod types;

pub use constants::{
    EnvFlags, Pgno, TxnId, WriteFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_READERS, MAX_KEY_SIZE,
    MAX_VALUE_SIZE, PAGE_SIZE,
};
pub use cursor::{Cursor, Entry, Iter};
pub use embedding::{
    Codec, DType, EmbeddingStore, F32Codec, StoreOptions, Tensor, TensorCodec,
    DEFAULT_STORE_MAP_SIZE,
};
pub use env::{EnvBuilder, Environment};
pub use error::{Error, Result};
pub use transaction::{ReadTxn, Transaction, WriteTxn};
pub use types::{CursorOp, EnvInfo, ReaderInfo, Stat, WriteWait};
