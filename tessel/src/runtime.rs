use crossbeam::thread;
use tracing::trace;

use crate::data::{Fence, TaskId};
use crate::error::{Error, Result};

// ————————————————————————————————— Runtime ———————————————————————————————— //

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct WorkerId {
    pub thread_id: u32,
}

impl WorkerId {
    pub fn new(thread_id: u32) -> Self {
        Self { thread_id }
    }
}

/// A mapping from task arguments to the worker executing the task, automatically implemented for
/// closures. Tile algorithms map on the coordinates of the tile a task writes.
///
/// # Safety
///
/// Synchronization relies on every worker computing the same mapping for the same task: the
/// mapping must be deterministic.
pub trait Mapping<Args = usize>: FnMut(Args) -> WorkerId + Send {}

impl<T, Args> Mapping<Args> for T where T: FnMut(Args) -> WorkerId + Send {}

/// Attribute tasks among `nb_workers` in a round robin fashion.
pub fn round_robin(nb_workers: usize) -> impl Mapping + Clone {
    move |task_id: usize| WorkerId::new((task_id % nb_workers) as u32)
}

/// Owner computes on a 2D block cyclic distribution of tiles over a near-square grid of
/// `nb_workers`.
pub fn block_cyclic(nb_workers: usize) -> impl Mapping<(usize, usize)> + Clone {
    let p = (1..=nb_workers)
        .rev()
        .find(|p| p * p <= nb_workers && nb_workers % p == 0)
        .unwrap_or(1);
    let q = (nb_workers / p).max(1);
    move |(i, j): (usize, usize)| WorkerId::new(((i % p) * q + j % q) as u32)
}

/// Number of workers for a region with `parallelism` independent outputs.
pub fn worker_count(parallelism: usize) -> usize {
    parallelism.min(num_cpus::get()).max(1)
}

/// The per-worker object that numbers tasks and decides which ones this worker executes.
pub struct Runtime<'map, Args = usize> {
    worker_id: WorkerId,
    task_counter: usize,
    executed: usize,
    priority: i32,
    map: Box<dyn Mapping<Args> + 'map>,
}

pub enum TaskOwnership {
    Owner,
    NotOwner,
}

impl<'map, Args> Runtime<'map, Args> {
    pub fn new(thread_id: u32, priority: i32, map: impl Mapping<Args> + 'map) -> Self {
        Self {
            worker_id: WorkerId { thread_id },
            task_counter: 0,
            executed: 0,
            priority,
            map: Box::new(map),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Scheduling hint of the region. Tasks keep program order on shared tiles regardless.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Number of tasks declared so far.
    pub fn declared(&self) -> usize {
        self.task_counter
    }

    /// Number of tasks this worker executed so far.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Given the mapping arguments, return the next task ID and whether this worker executes it.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per task by every worker, in program order. Use the `task!`
    /// macro.
    pub unsafe fn next_task_args(&mut self, args: Args) -> (TaskId, TaskOwnership) {
        self.task_counter += 1;
        let task_id = TaskId(self.task_counter);
        let ownership = if (self.map)(args) == self.worker_id {
            self.executed += 1;
            TaskOwnership::Owner
        } else {
            TaskOwnership::NotOwner
        };
        (task_id, ownership)
    }
}

impl<'map> Runtime<'map, usize> {
    /// Return the next task ID and whether this worker executes it, mapping on the task ID.
    ///
    /// # Safety
    ///
    /// See `next_task_args`.
    pub unsafe fn next_task(&mut self) -> (TaskId, TaskOwnership) {
        self.next_task_args(self.task_counter + 1)
    }
}

/// Run `body` on `nb_workers` threads and join them.
///
/// Every worker executes `body` on its own copy of `args`, but a task declared with `task!` is
/// only executed by the worker the mapping assigns it to. The call returns once every worker,
/// hence every task, is done, so all updates are visible to the caller.
pub fn run_tasks<'region, Map, Args, T>(
    nb_workers: usize,
    priority: i32,
    map: Map,
    mut args: Args,
    body: fn(Runtime<'region, T>, Args),
) -> Result<()>
where
    Map: Mapping<T> + Clone + 'region,
    Args: Fence + Send + Clone + 'region,
{
    // Safety: regions are scoped, the previous one (if any) is joined.
    unsafe { args.fence() };
    trace!(nb_workers, priority, "task region");

    let joined = thread::scope(|scope| -> Result<()> {
        for thread_id in 0..nb_workers {
            let map = map.clone();
            let args = args.clone();
            let rt = Runtime::<'region, T>::new(thread_id as u32, priority, map);

            scope
                .builder()
                .name(format!("W{}", thread_id))
                .spawn(move |_| body(rt, args))?;
        }
        Ok(())
    });

    match joined {
        Ok(spawned) => spawned,
        Err(_) => Err(Error::WorkerPanicked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Handle;
    use crate::task;

    #[derive(Clone)]
    struct Chain {
        a: Handle<i64>,
        b: Handle<i64>,
    }

    impl Fence for Chain {
        unsafe fn fence(&mut self) {
            self.a.fence();
            self.b.fence();
        }
    }

    fn add(a: &i64, b: &mut i64) {
        *b += *a;
    }

    fn double(b: &mut i64) {
        *b *= 2;
    }

    fn scale_add(factor: i64, a: &i64, b: &mut i64) {
        *b = *b * factor + *a;
    }

    fn control_flow(mut rt: Runtime, chain: Chain) {
        let Chain { mut a, mut b } = chain;
        for _ in 0..10 {
            task! {
                rt, add,
                R: a;
                RW: b;
            }
            task! {
                rt, double,
                RW: b;
            }
            task! {
                rt, scale_add,
                args: (3);
                R: a;
                RW: b;
            }
        }
    }

    #[test]
    fn writes_on_a_shared_handle_keep_program_order() {
        let chain = Chain {
            a: Handle::new(1),
            b: Handle::new(0),
        };
        let mut expected = 0;
        for _ in 0..10 {
            expected = ((expected + 1) * 2) * 3 + 1;
        }

        run_tasks(3, 0, round_robin(3), chain.clone(), control_flow).unwrap();
        assert_eq!(*chain.b.lock(), expected);

        // Handles can be reused by a following region.
        *chain.b.lock() = 0;
        run_tasks(2, 0, round_robin(2), chain.clone(), control_flow).unwrap();
        assert_eq!(*chain.b.lock(), expected);
    }

    #[test]
    fn block_cyclic_uses_every_worker() {
        let mut map = block_cyclic(6);
        let mut seen: Vec<u32> = (0..2)
            .flat_map(|i| (0..3).map(move |j| (i, j)))
            .map(|ij| map(ij).thread_id)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn worker_count_is_bounded() {
        assert_eq!(worker_count(0), 1);
        assert!(worker_count(1_000_000) <= num_cpus::get());
    }
}
