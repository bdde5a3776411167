use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of one token on disk.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenSize {
    TwoBytes,
    FourBytes,
}

#[derive(Debug, Error)]
#[error("token size must be 2 or 4 bytes, got {0}")]
pub struct TokenSizeError(pub usize);

impl TokenSize {
    /// The on-disk value used for the `-1` prompt/response separator: all bits set.
    pub fn separator_value(&self) -> u32 {
        match self {
            TokenSize::TwoBytes => u16::MAX as u32,
            TokenSize::FourBytes => u32::MAX,
        }
    }
}

impl From<TokenSize> for usize {
    fn from(value: TokenSize) -> Self {
        match value {
            TokenSize::TwoBytes => 2,
            TokenSize::FourBytes => 4,
        }
    }
}

impl TryFrom<usize> for TokenSize {
    type Error = TokenSizeError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(TokenSize::TwoBytes),
            4 => Ok(TokenSize::FourBytes),
            x => Err(TokenSizeError(x)),
        }
    }
}
