//! Process-group communication.
//!
//! A `Communicator` connects the processes (ranks) a distributed matrix is spread over. The
//! engine only needs ordered point-to-point messages and a barrier; the collectives it uses
//! (`broadcast`, `all_gather`, `all_reduce_sum`) are built on top in `Collective`.
//!
//! Two implementations are provided: `SelfComm`, a group of one, and `ThreadComm`, a group of
//! ranks living in one address space, each rank being a thread and each ordered pair of ranks
//! being connected by a crossbeam channel. Messages between a pair of ranks are delivered in
//! order, so every rank must issue its communication calls in the same program order, as with
//! MPI.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::thread;

use crate::error::{Error, Result};
use crate::scalar::Scalar;

pub type Payload = Box<dyn Any + Send>;

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, dest: usize, payload: Payload) -> Result<()>;

    /// Blocks until the next message from `source` arrives.
    fn recv(&self, source: usize) -> Result<Payload>;

    fn barrier(&self);

    /// Number of collective operations this rank has entered.
    fn collective_calls(&self) -> usize;

    #[doc(hidden)]
    fn count_collective(&self);
}

/// Typed communication, available on every communicator.
pub trait Collective: Communicator {
    fn send_value<T: Send + 'static>(&self, dest: usize, value: T) -> Result<()> {
        self.send(dest, Box::new(value))
    }

    fn recv_value<T: Send + 'static>(&self, source: usize) -> Result<T> {
        self.recv(source)?
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| Error::Comm(format!("unexpected message type from rank {}", source)))
    }

    /// Blocking broadcast of `value` from `root`: returns on any rank only once every rank
    /// holds the root's value.
    fn broadcast<T: Clone + Send + 'static>(&self, value: &mut T, root: usize) -> Result<()> {
        self.count_collective();
        if self.size() == 1 {
            return Ok(());
        }
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&dest| dest != root) {
                self.send_value(dest, value.clone())?;
            }
        } else {
            *value = self.recv_value(root)?;
        }
        self.barrier();
        Ok(())
    }

    /// Every rank receives every rank's value, in rank order.
    fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>> {
        self.count_collective();
        let rank = self.rank();
        for dest in (0..self.size()).filter(|&dest| dest != rank) {
            self.send_value(dest, value.clone())?;
        }
        let mut values = Vec::with_capacity(self.size());
        for source in 0..self.size() {
            if source == rank {
                values.push(value.clone());
            } else {
                values.push(self.recv_value(source)?);
            }
        }
        Ok(values)
    }

    /// Sum over ranks, accumulated in rank order so that every rank gets the same bits.
    fn all_reduce_sum<T: Scalar>(&self, value: T) -> Result<T> {
        let values = self.all_gather(value)?;
        Ok(values.into_iter().fold(T::zero(), |acc, x| acc + x))
    }
}

impl<C: Communicator + ?Sized> Collective for C {}

// ———————————————————————————————— SelfComm ———————————————————————————————— //

/// A group made of the calling process only.
#[derive(Debug, Default)]
pub struct SelfComm {
    collectives: AtomicUsize,
}

impl SelfComm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Communicator> {
        Arc::new(Self::new())
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: usize, _payload: Payload) -> Result<()> {
        Err(Error::Comm(format!("rank {} does not exist in a group of one", dest)))
    }

    fn recv(&self, source: usize) -> Result<Payload> {
        Err(Error::Comm(format!("rank {} does not exist in a group of one", source)))
    }

    fn barrier(&self) {}

    fn collective_calls(&self) -> usize {
        self.collectives.load(Ordering::Relaxed)
    }

    fn count_collective(&self) {
        self.collectives.fetch_add(1, Ordering::Relaxed);
    }
}

// ——————————————————————————————— ThreadComm ——————————————————————————————— //

/// One rank of a group of threads.
pub struct ThreadComm {
    rank: usize,
    // Indexed by destination.
    senders: Vec<Sender<Payload>>,
    // Indexed by source.
    receivers: Vec<Receiver<Payload>>,
    barrier: Arc<Barrier>,
    collectives: AtomicUsize,
}

impl ThreadComm {
    /// Create the `size` endpoints of a fully connected group, endpoint `r` being rank `r`.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let channels: Vec<Vec<(Sender<Payload>, Receiver<Payload>)>> = (0..size)
            .map(|_| (0..size).map(|_| unbounded()).collect())
            .collect();
        let barrier = Arc::new(Barrier::new(size));

        (0..size)
            .map(|rank| ThreadComm {
                rank,
                senders: (0..size).map(|dest| channels[rank][dest].0.clone()).collect(),
                receivers: (0..size)
                    .map(|source| channels[source][rank].1.clone())
                    .collect(),
                barrier: barrier.clone(),
                collectives: AtomicUsize::new(0),
            })
            .collect()
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.size() || peer == self.rank {
            return Err(Error::Comm(format!(
                "rank {} cannot talk to rank {} in a group of {}",
                self.rank,
                peer,
                self.size()
            )));
        }
        Ok(())
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, dest: usize, payload: Payload) -> Result<()> {
        self.check_peer(dest)?;
        self.senders[dest]
            .send(payload)
            .map_err(|_| Error::Comm(format!("rank {} hung up", dest)))
    }

    fn recv(&self, source: usize) -> Result<Payload> {
        self.check_peer(source)?;
        self.receivers[source]
            .recv()
            .map_err(|_| Error::Comm(format!("rank {} hung up", source)))
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn collective_calls(&self) -> usize {
        self.collectives.load(Ordering::Relaxed)
    }

    fn count_collective(&self) {
        self.collectives.fetch_add(1, Ordering::Relaxed);
    }
}

/// Run `f` once per rank of a fresh `nb_ranks` group, each rank on its own thread, and return
/// the per-rank results in rank order.
pub fn spawn_group<R, F>(nb_ranks: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(Arc<dyn Communicator>) -> R + Sync,
    R: Send,
{
    let f = &f;
    let joined = thread::scope(|scope| -> Result<Vec<R>> {
        let mut handles = Vec::with_capacity(nb_ranks);
        for comm in ThreadComm::group(nb_ranks) {
            let handle = scope
                .builder()
                .name(format!("rank{}", comm.rank()))
                .spawn(move |_| f(Arc::new(comm)))?;
            handles.push(handle);
        }
        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| Error::WorkerPanicked))
            .collect()
    });
    joined.unwrap_or(Err(Error::WorkerPanicked))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_rank() {
        let values = spawn_group(4, |comm| {
            let mut value = if comm.rank() == 2 { [7_i64, 8, 9, 10] } else { [0; 4] };
            comm.broadcast(&mut value, 2).unwrap();
            (value, comm.collective_calls())
        })
        .unwrap();
        for (value, calls) in values {
            assert_eq!(value, [7, 8, 9, 10]);
            assert_eq!(calls, 1);
        }
    }

    #[test]
    fn all_reduce_is_identical_everywhere() {
        let sums = spawn_group(3, |comm| {
            let local = 0.1_f64 * (comm.rank() + 1) as f64;
            comm.all_reduce_sum(local).unwrap().to_bits()
        })
        .unwrap();
        assert!(sums.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn self_comm_collectives_are_local() {
        let comm = SelfComm::new();
        let mut kase = 2_i32;
        comm.broadcast(&mut kase, 0).unwrap();
        assert_eq!(kase, 2);
        assert_eq!(comm.all_gather(5_u8).unwrap(), vec![5]);
        assert_eq!(comm.collective_calls(), 2);
        assert!(comm.send_value(1, 0_u8).is_err());
    }
}
