use rkd_core::TokenSize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::traits::TokenDataset;

/// Leading bytes of every `.idx` file.
const INDEX_MAGIC: &[u8; 8] = b"RKDIDX\0\0";
const INDEX_VERSION: u64 = 1;
/// magic + version + dtype + count
const INDEX_HEADER_SIZE: usize = 8 + 8 + 1 + 8;

#[derive(Debug, Error)]
pub enum IndexedDatasetError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not an indexed dataset index (bad magic)")]
    BadMagic(PathBuf),

    #[error("unsupported index version {0}")]
    UnsupportedVersion(u64),

    #[error("unsupported token width code {0}")]
    BadTokenSize(u8),

    #[error("index {path} is truncated: needs {expected} bytes, has {found}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("item {index} spans bytes {start}..{end} but the data file holds {available}")]
    ItemOutOfBounds {
        index: usize,
        start: usize,
        end: usize,
        available: usize,
    },

    #[error("index {index} is out of bounds, we only have {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("item {index} holds token value {value}, which is not a valid token id")]
    CorruptToken { index: usize, value: u64 },

    #[error("token {token} cannot be stored with {token_size} bytes per token")]
    TokenOverflow { token: i32, token_size: usize },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> IndexedDatasetError + '_ {
    move |source| IndexedDatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{suffix}", prefix.display()))
}

pub fn data_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".bin")
}

pub fn index_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".idx")
}

fn mmap_file(path: &Path) -> Result<Box<dyn AsRef<[u8]> + Send + Sync>, IndexedDatasetError> {
    let file = File::open(path).map_err(io_err(path))?;
    let len = file.metadata().map_err(io_err(path))?.len();
    // zero-length mappings are rejected on some platforms
    if len == 0 {
        return Ok(Box::new(Vec::<u8>::new()));
    }
    let mmap = unsafe { memmap2::MmapOptions::new().map(&file) }.map_err(io_err(path))?;
    Ok(Box::new(mmap))
}

/// Streams token sequences into `<prefix>.bin` and writes `<prefix>.idx` on [`finalize`].
///
/// [`finalize`]: IndexedDatasetBuilder::finalize
pub struct IndexedDatasetBuilder {
    prefix: PathBuf,
    data: BufWriter<File>,
    token_size: TokenSize,
    sizes: Vec<u32>,
    offsets: Vec<u64>,
    next_offset: u64,
}

impl IndexedDatasetBuilder {
    pub fn new(prefix: impl AsRef<Path>, token_size: TokenSize) -> Result<Self, IndexedDatasetError> {
        let prefix = prefix.as_ref().to_path_buf();
        let path = data_path(&prefix);
        let data = BufWriter::new(File::create(&path).map_err(io_err(&path))?);
        Ok(Self {
            prefix,
            data,
            token_size,
            sizes: Vec::new(),
            offsets: Vec::new(),
            next_offset: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Appends one item. `-1` is stored as the separator value; every other token must be
    /// non-negative and strictly below the separator value.
    pub fn add_item(&mut self, tokens: &[i32]) -> Result<(), IndexedDatasetError> {
        let separator = u64::from(self.token_size.separator_value());
        let width = usize::from(self.token_size);
        let mut encoded = Vec::with_capacity(tokens.len() * width);
        for &token in tokens {
            let value = match token {
                -1 => separator,
                t if t >= 0 && (t as u64) < separator => t as u64,
                token => {
                    return Err(IndexedDatasetError::TokenOverflow {
                        token,
                        token_size: width,
                    })
                }
            };
            encoded.extend_from_slice(&value.to_le_bytes()[..width]);
        }
        let path = data_path(&self.prefix);
        self.data.write_all(&encoded).map_err(io_err(&path))?;
        self.offsets.push(self.next_offset);
        self.sizes.push(tokens.len() as u32);
        self.next_offset += (tokens.len() * width) as u64;
        Ok(())
    }

    /// Flushes the data file and writes the index. Returns the index path.
    pub fn finalize(mut self) -> Result<PathBuf, IndexedDatasetError> {
        let data = data_path(&self.prefix);
        self.data.flush().map_err(io_err(&data))?;

        let path = index_path(&self.prefix);
        let mut index = BufWriter::new(File::create(&path).map_err(io_err(&path))?);
        let mut header = Vec::with_capacity(INDEX_HEADER_SIZE);
        header.extend_from_slice(INDEX_MAGIC);
        header.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        header.push(usize::from(self.token_size) as u8);
        header.extend_from_slice(&(self.sizes.len() as u64).to_le_bytes());
        index.write_all(&header).map_err(io_err(&path))?;
        for size in &self.sizes {
            index.write_all(&size.to_le_bytes()).map_err(io_err(&path))?;
        }
        for offset in &self.offsets {
            index
                .write_all(&offset.to_le_bytes())
                .map_err(io_err(&path))?;
        }
        index.flush().map_err(io_err(&path))?;

        info!(
            path = %path.display(),
            items = self.sizes.len(),
            tokens = self.next_offset / usize::from(self.token_size) as u64,
            "Wrote indexed dataset"
        );
        Ok(path)
    }
}

/// Read-only view over a `<prefix>.bin` / `<prefix>.idx` pair.
pub struct IndexedDataset {
    data: Box<dyn AsRef<[u8]> + Send + Sync>,
    token_size: TokenSize,
    sizes: Vec<u32>,
    offsets: Vec<u64>,
}

impl std::fmt::Debug for IndexedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedDataset")
            .field("token_size", &self.token_size)
            .field("items", &self.sizes.len())
            .finish()
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

impl IndexedDataset {
    pub fn open(prefix: impl AsRef<Path>) -> Result<Self, IndexedDatasetError> {
        let prefix = prefix.as_ref();
        let idx_path = index_path(prefix);
        let index = std::fs::read(&idx_path).map_err(io_err(&idx_path))?;

        if index.len() < INDEX_HEADER_SIZE {
            return Err(IndexedDatasetError::Truncated {
                path: idx_path,
                expected: INDEX_HEADER_SIZE,
                found: index.len(),
            });
        }
        if &index[..8] != INDEX_MAGIC {
            return Err(IndexedDatasetError::BadMagic(idx_path));
        }
        let version = read_u64(&index, 8);
        if version != INDEX_VERSION {
            return Err(IndexedDatasetError::UnsupportedVersion(version));
        }
        let token_size = TokenSize::try_from(index[16] as usize)
            .map_err(|_| IndexedDatasetError::BadTokenSize(index[16]))?;
        let count = read_u64(&index, 17);

        // a corrupt count must not overflow the size computation
        let expected = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(4 + 8))
            .and_then(|bytes| bytes.checked_add(INDEX_HEADER_SIZE));
        let count = match expected {
            Some(expected) if expected <= index.len() => count as usize,
            expected => {
                return Err(IndexedDatasetError::Truncated {
                    path: idx_path,
                    expected: expected.unwrap_or(usize::MAX),
                    found: index.len(),
                })
            }
        };
        let sizes_start = INDEX_HEADER_SIZE;
        let offsets_start = sizes_start + count * 4;
        let sizes: Vec<u32> = (0..count)
            .map(|i| read_u32(&index, sizes_start + i * 4))
            .collect();
        let offsets: Vec<u64> = (0..count)
            .map(|i| read_u64(&index, offsets_start + i * 8))
            .collect();

        let bin_path = data_path(prefix);
        let data = mmap_file(&bin_path)?;
        let available = (*data).as_ref().len();
        let width = usize::from(token_size);
        for (i, (size, offset)) in sizes.iter().zip(offsets.iter()).enumerate() {
            let start = usize::try_from(*offset).unwrap_or(usize::MAX);
            let end = (*size as usize)
                .checked_mul(width)
                .and_then(|bytes| start.checked_add(bytes));
            match end {
                Some(end) if end <= available => {}
                end => {
                    return Err(IndexedDatasetError::ItemOutOfBounds {
                        index: i,
                        start,
                        end: end.unwrap_or(usize::MAX),
                        available,
                    })
                }
            }
        }

        debug!(
            prefix = %prefix.display(),
            items = count,
            token_size = width,
            "Opened indexed dataset"
        );
        Ok(Self {
            data,
            token_size,
            sizes,
            offsets,
        })
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn token_size(&self) -> TokenSize {
        self.token_size
    }

    /// Length in tokens of item `index`, separator included.
    pub fn item_len(&self, index: usize) -> Option<usize> {
        self.sizes.get(index).map(|s| *s as usize)
    }

    /// Decodes item `index`, mapping the separator value back to `-1`.
    pub fn get(&self, index: usize) -> Result<Vec<i32>, IndexedDatasetError> {
        let (size, offset) = match (self.sizes.get(index), self.offsets.get(index)) {
            (Some(size), Some(offset)) => (*size as usize, *offset as usize),
            _ => {
                return Err(IndexedDatasetError::IndexOutOfRange {
                    index,
                    len: self.len(),
                })
            }
        };
        let width = usize::from(self.token_size);
        let separator = u64::from(self.token_size.separator_value());
        let bytes = &(*self.data).as_ref()[offset..offset + size * width];
        bytes
            .chunks_exact(width)
            .map(|chunk| {
                let value = match self.token_size {
                    TokenSize::TwoBytes => u16::from_le_bytes([chunk[0], chunk[1]]) as u64,
                    TokenSize::FourBytes => {
                        u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64
                    }
                };
                if value == separator {
                    return Ok(-1);
                }
                i32::try_from(value)
                    .map_err(|_| IndexedDatasetError::CorruptToken { index, value })
            })
            .collect()
    }
}

impl TokenDataset for IndexedDataset {
    fn len(&self) -> usize {
        IndexedDataset::len(self)
    }

    fn item(&self, index: usize) -> anyhow::Result<Vec<i32>> {
        Ok(self.get(index)?)
    }
}
