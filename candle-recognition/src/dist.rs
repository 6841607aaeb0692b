//! Execution context for multi-worker training.
//!
//! Loss parsing needs to know whether it runs alongside other workers so that every worker
//! logs the same numbers. The context is passed in explicitly as a [`ProcessGroup`].

use crate::{Error, Result};
use candle::Tensor;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Averages `value` element-wise over all workers of the group.
    ///
    /// Blocks until every worker has contributed its local value for the current round. The
    /// result has the shape, dtype and device of `value`.
    fn all_reduce_mean(&self, value: &Tensor) -> Result<Tensor>;

    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }
}

/// A lone worker.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, value: &Tensor) -> Result<Tensor> {
        Ok(value.clone())
    }
}

#[derive(Default)]
struct Round {
    generation: u64,
    arrived: usize,
    sum: Vec<f64>,
    mismatch: bool,
    published: Option<std::result::Result<Arc<Vec<f64>>, String>>,
}

struct Shared {
    world_size: usize,
    round: Mutex<Round>,
    done: Condvar,
}

/// An in-process collective for workers running on separate threads.
///
/// Each worker holds its own handle. A worker that skips a round blocks the others
/// forever.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates one handle per worker. Handle `i` has rank `i`.
    pub fn new_group(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            world_size: world_size.max(1),
            round: Mutex::new(Round::default()),
            done: Condvar::new(),
        });
        (0..world_size.max(1))
            .map(|rank| LocalGroup {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }

    fn reduce(&self, local: Vec<f64>) -> Result<Arc<Vec<f64>>> {
        let shared = &self.shared;
        let mut round = shared.round.lock().map_err(poisoned)?;
        let generation = round.generation;

        if round.arrived == 0 {
            round.sum = local;
            round.mismatch = false;
        } else if round.sum.len() != local.len() {
            round.mismatch = true;
        } else {
            for (acc, value) in round.sum.iter_mut().zip(local) {
                *acc += value;
            }
        }
        round.arrived += 1;

        if round.arrived == shared.world_size {
            let published = if round.mismatch {
                Err("workers contributed values of different sizes".to_string())
            } else {
                let n = shared.world_size as f64;
                Ok(Arc::new(round.sum.iter().map(|v| v / n).collect()))
            };
            round.published = Some(published);
            round.arrived = 0;
            round.generation += 1;
            shared.done.notify_all();
        } else {
            while round.generation == generation {
                round = shared.done.wait(round).map_err(poisoned)?;
            }
        }

        match &round.published {
            Some(Ok(mean)) => Ok(mean.clone()),
            Some(Err(msg)) => Err(Error::Distributed(msg.clone())),
            None => Err(Error::Distributed("round finished without a result".to_string())),
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Distributed("worker panicked during a collective".to_string())
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_mean(&self, value: &Tensor) -> Result<Tensor> {
        if self.shared.world_size == 1 {
            return Ok(value.clone());
        }
        let local = value
            .to_dtype(candle::DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?;
        let mean = self.reduce(local)?;
        let out = Tensor::from_vec(mean.as_ref().clone(), value.shape().clone(), value.device())?;
        Ok(out.to_dtype(value.dtype())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn single_process_is_identity() -> Result<()> {
        let t = Tensor::new(&[1f32, 2., 3.], &Device::Cpu)?;
        let out = SingleProcess.all_reduce_mean(&t)?;
        assert_eq!(out.to_vec1::<f32>()?, vec![1., 2., 3.]);
        assert!(!SingleProcess.is_distributed());
        Ok(())
    }

    #[test]
    fn local_group_averages_over_repeated_rounds() -> Result<()> {
        let handles: Vec<_> = LocalGroup::new_group(4)
            .into_iter()
            .map(|group| {
                std::thread::spawn(move || -> Result<Vec<f32>> {
                    let mut seen = Vec::new();
                    for round in 0..3 {
                        let local = (group.rank() + round) as f32;
                        let t = Tensor::new(&[local, 2. * local], &Device::Cpu)?;
                        let avg = group.all_reduce_mean(&t)?.to_vec1::<f32>()?;
                        seen.extend(avg);
                    }
                    Ok(seen)
                })
            })
            .collect();
        for handle in handles {
            let seen = handle.join().expect("worker thread")?;
            assert_eq!(seen, vec![1.5, 3.0, 2.5, 5.0, 3.5, 7.0]);
        }
        Ok(())
    }

    #[test]
    fn mismatched_contributions_fail_everywhere() -> Result<()> {
        let handles: Vec<_> = LocalGroup::new_group(2)
            .into_iter()
            .map(|group| {
                std::thread::spawn(move || -> Result<()> {
                    let len = group.rank() + 1;
                    let t = Tensor::zeros(len, candle::DType::F32, &Device::Cpu)?;
                    group.all_reduce_mean(&t).map(|_| ())
                })
            })
            .collect();
        for handle in handles {
            let result = handle.join().expect("worker thread");
            assert!(matches!(result, Err(Error::Distributed(_))));
        }
        Ok(())
    }
}
