//! A key/value store for embedding vectors.
//!
//! String keys map to encoded arrays. Every call runs in its own
//! transaction: reads see one consistent snapshot, writes commit before
//! returning. The encoding is pluggable through [`Codec`]; the default
//! stores one-dimensional `f32` vectors as raw little-endian bytes.
//!
//! ```no_run
//! use embedb::{EmbeddingStore, StoreOptions};
//!
//! let store = EmbeddingStore::open("/tmp/vectors/test.edb", StoreOptions::writable())?;
//! store.set("a", &vec![1.0, 2.0, 3.0])?;
//! assert_eq!(store.get("a")?, Some(vec![1.0, 2.0, 3.0]));
//! # Ok::<(), embedb::Error>(())
//! ```

use std::borrow::Borrow;
use std::fs;
use std::path::Path;

use crate::constants::EnvFlags;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::WriteWait;

/// Default map size of a store
pub const DEFAULT_STORE_MAP_SIZE: usize = 1 << 30;

/// Converts stored values to and from bytes
pub trait Codec {
    type Value;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value>;
}

/// One-dimensional `f32` vectors as raw little-endian bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct F32Codec;

impl Codec for F32Codec {
    type Value = Vec<f32>;

    fn encode(&self, value: &Vec<f32>) -> Result<Vec<u8>> {
        Ok(value.iter().flat_map(|x| x.to_le_bytes()).collect())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() % 4 != 0 {
            return Err(Error::Decode(format!(
                "{} bytes is not a whole number of f32 values",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Element type of a [`Tensor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    F32 = 1,
    F64 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
}

impl DType {
    /// Size of one element in bytes
    pub fn item_size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => DType::F32,
            2 => DType::F64,
            3 => DType::I32,
            4 => DType::I64,
            5 => DType::U8,
            _ => return Err(Error::Decode(format!("unknown dtype tag {}", tag))),
        })
    }
}

/// An n-dimensional array of fixed-size elements.
///
/// `data` holds the elements in row-major order, little-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

/// Byte size of a shape, `None` if it does not fit in `usize`
fn shape_bytes(shape: &[usize], dtype: DType) -> Option<usize> {
    shape
        .iter()
        .try_fold(dtype.item_size(), |acc, &dim| acc.checked_mul(dim))
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        if shape.len() > MAX_TENSOR_RANK {
            return Err(Error::Decode(format!("rank {} is too large", shape.len())));
        }
        let expected = shape_bytes(&shape, dtype)
            .ok_or_else(|| Error::Decode("shape too large".to_string()))?;
        if data.len() != expected {
            return Err(Error::Decode(format!(
                "shape {:?} needs {} bytes, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Tensor { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Tensor::new(
            DType::F32,
            shape,
            values.iter().flat_map(|x| x.to_le_bytes()).collect(),
        )
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.item_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        if self.dtype != DType::F32 {
            return Err(Error::Decode(format!("tensor holds {:?}, not F32", self.dtype)));
        }
        F32Codec.decode(&self.data)
    }
}

const TENSOR_MAGIC: &[u8; 4] = b"EDBT";
const TENSOR_VERSION: u8 = 1;
const MAX_TENSOR_RANK: usize = u16::MAX as usize;

/// Arrays of any shape and element type.
///
/// ```text
/// | "EDBT" | version u8 | dtype u8 | rank u16 | dims u64 * rank | data |
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TensorCodec;

impl Codec for TensorCodec {
    type Value = Tensor;

    fn encode(&self, value: &Tensor) -> Result<Vec<u8>> {
        let rank = u16::try_from(value.shape.len())
            .map_err(|_| Error::Decode(format!("rank {} is too large", value.shape.len())))?;
        if shape_bytes(&value.shape, value.dtype) != Some(value.data.len()) {
            return Err(Error::Decode(format!(
                "shape {:?} does not match {} data bytes",
                value.shape,
                value.data.len()
            )));
        }
        let mut out = Vec::with_capacity(8 + 8 * value.shape.len() + value.data.len());
        out.extend_from_slice(TENSOR_MAGIC);
        out.push(TENSOR_VERSION);
        out.push(value.dtype as u8);
        out.extend_from_slice(&rank.to_le_bytes());
        for dim in &value.shape {
            out.extend_from_slice(&(*dim as u64).to_le_bytes());
        }
        out.extend_from_slice(&value.data);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Tensor> {
        let truncated = || Error::Decode("truncated tensor".to_string());
        if bytes.len() < 8 || &bytes[..4] != TENSOR_MAGIC {
            return Err(Error::Decode("missing tensor header".to_string()));
        }
        if bytes[4] != TENSOR_VERSION {
            return Err(Error::Decode(format!("unsupported tensor version {}", bytes[4])));
        }
        let dtype = DType::from_tag(bytes[5])?;
        let rank = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        let dims_end = 8 + rank * 8;
        let dims = bytes.get(8..dims_end).ok_or_else(truncated)?;
        let shape = dims
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                usize::try_from(u64::from_le_bytes(raw))
                    .map_err(|_| Error::Decode("dimension too large".to_string()))
            })
            .collect::<Result<Vec<usize>>>()?;
        Tensor::new(dtype, shape, bytes[dims_end..].to_vec())
    }
}

/// Options for [`EmbeddingStore::open`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub readonly: bool,
    /// Maximum size of the data file
    pub map_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            readonly: true,
            map_size: DEFAULT_STORE_MAP_SIZE,
        }
    }
}

impl StoreOptions {
    pub fn writable() -> Self {
        Self {
            readonly: false,
            ..Self::default()
        }
    }
}

/// String-keyed store of encoded arrays
#[derive(Debug)]
pub struct EmbeddingStore<C = F32Codec> {
    env: Environment,
    codec: C,
}

impl EmbeddingStore<F32Codec> {
    /// Open a store of `f32` vectors, creating missing parent directories
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        Self::with_codec(path, options, F32Codec)
    }
}

impl<C: Codec> EmbeddingStore<C> {
    pub fn with_codec<P: AsRef<Path>>(path: P, options: StoreOptions, codec: C) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let flags = if options.readonly {
            EnvFlags::RDONLY
        } else {
            EnvFlags::empty()
        };
        let env = Environment::builder()
            .map_size(options.map_size)
            .flags(flags)
            .write_wait(WriteWait::Block)
            .open(path)?;
        Ok(EmbeddingStore { env, codec })
    }

    /// The underlying environment
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn get(&self, key: &str) -> Result<Option<C::Value>> {
        let txn = self.env.begin_read()?;
        txn.get(key.as_bytes())?
            .map(|bytes| self.codec.decode(bytes))
            .transpose()
    }

    /// Look up several keys in one snapshot, keeping input order
    pub fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<Option<C::Value>>> {
        let txn = self.env.begin_read()?;
        let keys: Vec<&[u8]> = keys.iter().map(|k| k.as_ref().as_bytes()).collect();
        txn.get_multi(&keys)?
            .into_iter()
            .map(|found| found.map(|bytes| self.codec.decode(bytes)).transpose())
            .collect()
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.env.begin_read()?.contains(key.as_bytes())
    }

    pub fn set(&self, key: &str, value: &C::Value) -> Result<()> {
        let bytes = self.codec.encode(value)?;
        let mut txn = self.env.begin_write()?;
        txn.put(key.as_bytes(), &bytes)?;
        txn.commit()
    }

    /// Store many pairs in a single transaction
    pub fn update<I, K, V>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Borrow<C::Value>,
    {
        let pairs = items
            .into_iter()
            .map(|(k, v)| -> Result<(Vec<u8>, Vec<u8>)> {
                Ok((k.as_ref().as_bytes().to_vec(), self.codec.encode(v.borrow())?))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut txn = self.env.begin_write()?;
        txn.put_multi(pairs)?;
        txn.commit()
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut txn = self.env.begin_write()?;
        let found = txn.delete(key.as_bytes())?;
        txn.commit()?;
        Ok(found)
    }

    /// Remove several keys in one transaction
    pub fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<bool>> {
        let mut txn = self.env.begin_write()?;
        let keys: Vec<&[u8]> = keys.iter().map(|k| k.as_ref().as_bytes()).collect();
        let found = txn.delete_multi(&keys)?;
        txn.commit()?;
        Ok(found)
    }

    /// All keys in byte order
    pub fn keys(&self) -> Result<Vec<String>> {
        let txn = self.env.begin_read()?;
        let cursor = txn.cursor()?;
        cursor
            .iter()
            .map(|entry| entry.and_then(|(k, _)| decode_key(k)))
            .collect()
    }

    /// All values in key order
    pub fn values(&self) -> Result<Vec<C::Value>> {
        let txn = self.env.begin_read()?;
        let cursor = txn.cursor()?;
        cursor
            .iter()
            .map(|entry| entry.and_then(|(_, v)| self.codec.decode(v)))
            .collect()
    }

    /// All pairs in key order
    pub fn items(&self) -> Result<Vec<(String, C::Value)>> {
        let txn = self.env.begin_read()?;
        let cursor = txn.cursor()?;
        cursor
            .iter()
            .map(|entry| {
                let (k, v) = entry?;
                Ok((decode_key(k)?, self.codec.decode(v)?))
            })
            .collect()
    }

    /// Number of stored vectors
    pub fn len(&self) -> usize {
        self.env.stat().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(self) -> Result<()> {
        self.env.close()
    }
}

fn decode_key(key: &[u8]) -> Result<String> {
    String::from_utf8(key.to_vec()).map_err(|e| Error::Decode(format!("key is not utf-8: {}", e)))
}
