use serde::{Deserialize, Serialize};

/// Ordering policy for a data partition.
///
/// Evaluation always runs with [`Shuffle::DontShuffle`] so every worker walks
/// its shard in index order.
#[derive(Serialize, Deserialize, Clone, Debug, Copy, Default, PartialEq, Eq)]
pub enum Shuffle {
    #[default]
    DontShuffle,
    Seeded([u8; 32]),
}

impl Shuffle {
    /// Build a seeded shuffle from a small integer seed, placing it in the
    /// trailing bytes of the 32-byte ChaCha seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut array = [0u8; 32];
        array[24..32].copy_from_slice(&seed.to_be_bytes());
        Shuffle::Seeded(array)
    }
}
