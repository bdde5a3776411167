use std::sync::{Arc, Barrier, Mutex};
use tch::{Device, Tensor};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum CommunicatorError {
    #[error("collective mismatch: rank {rank} contributed shape {actual:?}, rank 0 contributed {expected:?}")]
    CollectiveMismatch {
        rank: usize,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("all_gather_concat needs a 1-d tensor, got shape {0:?}")]
    NotAVector(Vec<i64>),

    #[error("a peer panicked while holding the collective rendezvous")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceType {
    Sum,
    Max,
}

#[derive(Debug)]
struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// An in-process data-parallel group: one [`Communicator`] per replica thread.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    world_size: usize,
    shared: Arc<Rendezvous>,
}

impl LocalGroup {
    pub fn new(world_size: usize) -> Self {
        assert!(world_size > 0, "world size must be positive");
        Self {
            world_size,
            shared: Arc::new(Rendezvous {
                barrier: Barrier::new(world_size),
                slots: Mutex::new((0..world_size).map(|_| None).collect()),
            }),
        }
    }

    /// Communicators for ranks `0..world_size`, in rank order.
    pub fn communicators(&self) -> Vec<Communicator> {
        (0..self.world_size)
            .map(|rank| {
                Communicator::Local(LocalCommunicator {
                    rank,
                    world_size: self.world_size,
                    shared: self.shared.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<Rendezvous>,
}

impl LocalCommunicator {
    /// Publishes a CPU copy of `tensor` and returns every rank's contribution in rank order.
    ///
    /// Blocks until all ranks have called it. Two barriers keep a fast rank from
    /// overwriting its slot before slower ranks have read the current round.
    fn exchange(&self, tensor: &Tensor) -> Result<Vec<Tensor>, CommunicatorError> {
        let contribution = tensor.detach().to_device(Device::Cpu).copy();
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| CommunicatorError::Poisoned)?;
            slots[self.rank] = Some(contribution);
        }
        self.shared.barrier.wait();
        let gathered = {
            let slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| CommunicatorError::Poisoned)?;
            slots
                .iter()
                .map(|slot| slot.as_ref().map(|t| t.shallow_clone()))
                .collect::<Option<Vec<_>>>()
        };
        self.shared.barrier.wait();
        gathered.ok_or(CommunicatorError::Poisoned)
    }
}

/// Handle to the data-parallel replica group.
///
/// `None` is a group of one: rank 0, size 1, every collective is the identity.
#[derive(Debug)]
pub enum Communicator {
    None,
    Local(LocalCommunicator),
}

fn check_same_shapes(gathered: &[Tensor]) -> Result<(), CommunicatorError> {
    let expected = gathered[0].size();
    for (rank, t) in gathered.iter().enumerate().skip(1) {
        let actual = t.size();
        if actual != expected {
            return Err(CommunicatorError::CollectiveMismatch {
                rank,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

impl Communicator {
    pub fn none() -> Self {
        Self::None
    }

    pub fn rank(&self) -> usize {
        match self {
            Communicator::None => 0,
            Communicator::Local(local) => local.rank,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Communicator::None => 1,
            Communicator::Local(local) => local.world_size,
        }
    }

    /// The lowest rank, which owns report and checkpoint side-record writes.
    pub fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Reduces `tensor` across the group in place. Contributions are combined in rank
    /// order, so every rank ends up with bit-identical values.
    pub fn all_reduce(&self, tensor: &mut Tensor, op: ReduceType) -> Result<(), CommunicatorError> {
        match self {
            Communicator::None => Ok(()),
            Communicator::Local(local) => {
                let gathered = local.exchange(tensor)?;
                check_same_shapes(&gathered)?;
                let mut reduced = gathered[0].shallow_clone();
                for t in &gathered[1..] {
                    reduced = match op {
                        ReduceType::Sum => reduced + t,
                        ReduceType::Max => reduced.maximum(t),
                    };
                }
                trace!(rank = local.rank, ?op, shape = ?tensor.size(), "all_reduce");
                tensor.copy_(&reduced.to_device(tensor.device()));
                Ok(())
            }
        }
    }

    /// Every rank's `tensor`, in rank order. All contributions must share one shape.
    pub fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>, CommunicatorError> {
        match self {
            Communicator::None => Ok(vec![tensor.shallow_clone()]),
            Communicator::Local(local) => {
                let gathered = local.exchange(tensor)?;
                check_same_shapes(&gathered)?;
                trace!(rank = local.rank, shape = ?tensor.size(), "all_gather");
                let device = tensor.device();
                Ok(gathered.into_iter().map(|t| t.to_device(device)).collect())
            }
        }
    }

    /// Concatenates a 1-d tensor from every rank, in rank order, allowing each rank to
    /// contribute a different length.
    ///
    /// Lengths are exchanged first, then every rank pads to the longest contribution so
    /// the payload gather is shape-uniform, and the padding is trimmed afterwards.
    pub fn all_gather_concat(&self, vector: &Tensor) -> Result<Tensor, CommunicatorError> {
        let len = match vector.size().as_slice() {
            &[len] => len,
            other => return Err(CommunicatorError::NotAVector(other.to_vec())),
        };
        let lengths: Vec<i64> = self
            .all_gather(&Tensor::from_slice(&[len]))?
            .iter()
            .map(|t| t.int64_value(&[0]))
            .collect();
        let longest = lengths.iter().copied().max().unwrap_or(0);

        let padded = if len < longest {
            let padding = Tensor::zeros([longest - len], (vector.kind(), vector.device()));
            Tensor::cat(&[vector.shallow_clone(), padding], 0)
        } else {
            vector.shallow_clone()
        };
        let parts: Vec<Tensor> = self
            .all_gather(&padded)?
            .iter()
            .zip(&lengths)
            .map(|(part, len)| part.narrow(0, 0, *len))
            .collect();
        Ok(Tensor::cat(&parts, 0))
    }

    pub fn barrier(&self) {
        if let Communicator::Local(local) = self {
            local.shared.barrier.wait();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tch::Kind;

    /// Runs `test_fn` on one thread per rank of a fresh [`LocalGroup`] and returns the
    /// per-rank results in rank order.
    pub(crate) fn run_parallel_test<F, R>(world_size: usize, test_fn: F) -> Vec<R>
    where
        F: Fn(Communicator) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let test_fn = Arc::new(test_fn);
        let threads: Vec<_> = LocalGroup::new(world_size)
            .communicators()
            .into_iter()
            .map(|comm| {
                let test_fn = test_fn.clone();
                std::thread::spawn(move || test_fn(comm))
            })
            .collect();

        threads
            .into_iter()
            .map(|thread| thread.join().expect("Thread panicked"))
            .collect()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        Vec::<f32>::try_from(&t.to_kind(Kind::Float)).unwrap()
    }

    #[test]
    fn test_none_is_identity() {
        let comm = Communicator::none();
        assert_eq!((comm.rank(), comm.size()), (0, 1));
        let mut t = Tensor::from_slice(&[1.5f32, -2.0]);
        comm.all_reduce(&mut t, ReduceType::Sum).unwrap();
        assert_eq!(values(&t), vec![1.5, -2.0]);
        let gathered = comm.all_gather_concat(&t).unwrap();
        assert_eq!(values(&gathered), vec![1.5, -2.0]);
        comm.barrier();
    }

    #[test]
    fn test_all_reduce_sum_and_max() {
        let results = run_parallel_test(3, |comm| {
            let rank = comm.rank() as f32;
            let mut sum = Tensor::from_slice(&[rank, 10.0 * rank]);
            comm.all_reduce(&mut sum, ReduceType::Sum).unwrap();
            let mut max = Tensor::from_slice(&[rank, -rank]);
            comm.all_reduce(&mut max, ReduceType::Max).unwrap();
            (values(&sum), values(&max))
        });
        for (sum, max) in results {
            assert_eq!(sum, vec![3.0, 30.0]);
            assert_eq!(max, vec![2.0, 0.0]);
        }
    }

    #[test]
    fn test_all_gather_concat_uneven() {
        let results = run_parallel_test(2, |comm| {
            let local: Vec<f32> = if comm.rank() == 0 {
                vec![1.0, 2.0, 3.0]
            } else {
                vec![4.0, 5.0, 6.0, 7.0, 8.0]
            };
            let gathered = comm.all_gather_concat(&Tensor::from_slice(&local)).unwrap();
            values(&gathered)
        });
        for gathered in results {
            assert_eq!(gathered, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        }
    }

    #[test]
    fn test_all_gather_concat_with_empty_rank() {
        let results = run_parallel_test(3, |comm| {
            let local: Vec<f32> = (0..comm.rank()).map(|i| i as f32).collect();
            let gathered = comm.all_gather_concat(&Tensor::from_slice(&local)).unwrap();
            values(&gathered)
        });
        for gathered in results {
            assert_eq!(gathered, vec![0.0, 0.0, 1.0]);
        }
    }

    #[test]
    fn test_shape_mismatch_is_reported_on_every_rank() {
        let results = run_parallel_test(2, |comm| {
            let len = 2 + comm.rank() as i64;
            let t = Tensor::zeros([len], (Kind::Float, Device::Cpu));
            comm.all_gather(&t).map(|_| ())
        });
        for result in results {
            assert!(matches!(
                result,
                Err(CommunicatorError::CollectiveMismatch { rank: 1, .. })
            ));
        }
    }
}
