//! The distributed communication primitives used to gather statistics.

use std::fmt::Debug;
use std::num::NonZero;
use std::sync::{Arc, Barrier, Mutex};

use crate::ERR_POISONED_LOCK;

/// Collective communication between the processes of a distributed job.
///
/// All methods are collective except [`rank()`](Self::rank) and [`size()`](Self::size): every
/// participating process must call them in the same order, and each call blocks until the
/// slowest participant arrives.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Debug + Send + Sync {
    /// The index of this process, `0..size()`. Rank 0 coordinates the gather.
    fn rank(&self) -> usize;

    /// The number of participating processes.
    fn size(&self) -> usize;

    /// Collects one value from every process on rank 0.
    ///
    /// Returns the values ordered by rank on rank 0 and an empty vector elsewhere.
    fn gather_f64(&self, value: f64) -> Vec<f64>;

    /// Collects one counter from every process on rank 0.
    ///
    /// Returns the values ordered by rank on rank 0 and an empty vector elsewhere.
    fn gather_u64(&self, value: u64) -> Vec<u64>;

    /// Collects one byte buffer from every process on rank 0.
    ///
    /// Returns the buffers ordered by rank on rank 0 and an empty vector elsewhere.
    fn gather_bytes(&self, bytes: Vec<u8>) -> Vec<Vec<u8>>;

    /// Distributes the buffer of rank 0 to every process.
    ///
    /// The buffers passed by other ranks are ignored. Every process returns the buffer of
    /// rank 0.
    fn broadcast_bytes(&self, bytes: Vec<u8>) -> Vec<u8>;

    /// Waits until every process has reached this point.
    fn barrier(&self);
}

/// The degenerate transport of a job that consists of a single process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Transport for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather_f64(&self, value: f64) -> Vec<f64> {
        vec![value]
    }

    fn gather_u64(&self, value: u64) -> Vec<u64> {
        vec![value]
    }

    fn gather_bytes(&self, bytes: Vec<u8>) -> Vec<Vec<u8>> {
        vec![bytes]
    }

    fn broadcast_bytes(&self, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }

    fn barrier(&self) {}
}

/// A distributed job simulated by threads of the current process.
///
/// Each rank is one [`LocalCluster`] handle, to be moved onto its own thread. This allows
/// multi-process aggregation to be exercised without a message passing runtime.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
/// use std::thread;
///
/// use perf_sections::{LocalCluster, Transport};
///
/// let ranks = LocalCluster::new(NonZero::new(3).unwrap());
///
/// let gathered = thread::scope(|s| {
///     let handles: Vec<_> = ranks
///         .into_iter()
///         .map(|rank| s.spawn(move || rank.gather_u64(rank.rank() as u64 * 10)))
///         .collect();
///
///     handles
///         .into_iter()
///         .map(|h| h.join().unwrap())
///         .collect::<Vec<_>>()
/// });
///
/// assert_eq!(gathered[0], vec![0, 10, 20]);
/// assert!(gathered[1].is_empty());
/// ```
#[derive(Debug)]
pub struct LocalCluster {
    rank: usize,
    shared: Arc<ClusterShared>,
}

#[derive(Debug)]
struct ClusterShared {
    size: usize,
    barrier: Barrier,
    f64_slots: Mutex<Vec<f64>>,
    u64_slots: Mutex<Vec<u64>>,
    byte_slots: Mutex<Vec<Vec<u8>>>,
}

impl LocalCluster {
    /// Creates the handles of all ranks of a simulated job, ordered by rank.
    #[must_use]
    pub fn new(size: NonZero<usize>) -> Vec<Self> {
        let size = size.get();

        let shared = Arc::new(ClusterShared {
            size,
            barrier: Barrier::new(size),
            f64_slots: Mutex::new(vec![0.0; size]),
            u64_slots: Mutex::new(vec![0; size]),
            byte_slots: Mutex::new(vec![Vec::new(); size]),
        });

        (0..size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn gather<T: Clone>(&self, slots: &Mutex<Vec<T>>, value: T) -> Vec<T> {
        if let Some(slot) = slots.lock().expect(ERR_POISONED_LOCK).get_mut(self.rank) {
            *slot = value;
        }

        // Every rank has published its value once everyone is past this point.
        self.shared.barrier.wait();

        let gathered = if self.rank == 0 {
            slots.lock().expect(ERR_POISONED_LOCK).clone()
        } else {
            Vec::new()
        };

        // The root must finish reading before anyone overwrites a slot in the next gather.
        self.shared.barrier.wait();

        gathered
    }
}

impl Transport for LocalCluster {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn gather_f64(&self, value: f64) -> Vec<f64> {
        self.gather(&self.shared.f64_slots, value)
    }

    fn gather_u64(&self, value: u64) -> Vec<u64> {
        self.gather(&self.shared.u64_slots, value)
    }

    fn gather_bytes(&self, bytes: Vec<u8>) -> Vec<Vec<u8>> {
        self.gather(&self.shared.byte_slots, bytes)
    }

    fn broadcast_bytes(&self, bytes: Vec<u8>) -> Vec<u8> {
        if self.rank == 0 {
            if let Some(slot) = self
                .shared
                .byte_slots
                .lock()
                .expect(ERR_POISONED_LOCK)
                .first_mut()
            {
                *slot = bytes;
            }
        }

        self.shared.barrier.wait();

        let received = self
            .shared
            .byte_slots
            .lock()
            .expect(ERR_POISONED_LOCK)
            .first()
            .cloned()
            .unwrap_or_default();

        self.shared.barrier.wait();

        received
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}
