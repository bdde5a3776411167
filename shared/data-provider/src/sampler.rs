use rand::seq::SliceRandom;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rkd_core::Shuffle;

/// Assigns each worker a disjoint, rank-strided slice of a dataset.
///
/// Worker `rank` receives global positions `rank, rank + world_size, ...` of the
/// (optionally shuffled) index order. Nothing is padded or duplicated, so the union over
/// all ranks is exactly `0..len` and shard sizes differ by at most one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedPartition {
    pub rank: usize,
    pub world_size: usize,
    pub shuffle: Shuffle,
    pub drop_last: bool,
}

impl DistributedPartition {
    pub fn new(rank: usize, world_size: usize) -> Self {
        assert!(world_size > 0, "world size must be positive");
        assert!(
            rank < world_size,
            "rank {rank} out of range for world size {world_size}"
        );
        Self {
            rank,
            world_size,
            shuffle: Shuffle::DontShuffle,
            drop_last: false,
        }
    }

    pub fn with_shuffle(mut self, shuffle: Shuffle) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Drop a trailing batch shorter than the batch size in [`Self::batches`].
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Dataset indices owned by this rank, in visiting order.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        if let Shuffle::Seeded(seed) = self.shuffle {
            let mut rng = ChaCha8Rng::from_seed(seed);
            order.shuffle(&mut rng);
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// Number of indices this rank owns for a dataset of `len` items.
    pub fn shard_len(&self, len: usize) -> usize {
        len / self.world_size + usize::from(self.rank < len % self.world_size)
    }

    pub fn batches(&self, len: usize, batch_size: usize) -> Vec<Vec<usize>> {
        assert!(batch_size > 0, "batch size must be positive");
        self.indices(len)
            .chunks(batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}
