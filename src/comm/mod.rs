//! Transport abstraction for the gather-solve-scatter protocol.
//!
//! Provides a trait over the handful of collectives the bridge needs
//! (duplicate/split for building the communicator hierarchy, gatherv and
//! scatterv for moving rows and vectors to and from the proxy) and two
//! implementations: `LocalCluster` (in-process endpoints, used by tests
//! and single-process runs) and `MpiComm` (via the mpi crate, behind the
//! `distributed` feature).

pub mod local;
#[cfg(feature = "distributed")]
pub mod mpi;

use crate::error::Result;

/// Abstraction over inter-process communication.
///
/// Every method is collective over the group the handle belongs to: all
/// members must call it the same number of times in the same order, or
/// the group deadlocks. That ordering obligation sits with the caller;
/// the bridge cannot enforce it.
///
/// Variable-count gathers learn each member's contribution length from a
/// preceding `gather_counts`; the root passes those counts back in so the
/// hot path never re-negotiates sizes.
pub trait Communicator: Sized {
    /// This process's rank within the group.
    fn rank(&self) -> usize;

    /// Number of group members.
    fn size(&self) -> usize;

    /// Identity of the physical node this process runs on
    /// (hostname-equivalent). Ranks on the same node must agree.
    fn node_name(&self) -> String;

    /// Duplicate the group so internal collectives never alias the
    /// caller's own collective traffic.
    fn duplicate(&self) -> Result<Self>;

    /// Split into disjoint sub-groups by color. `None` opts out: the
    /// process participates in the call but receives no sub-group.
    /// Members of a sub-group are ranked by ascending `key` (ties broken
    /// by parent rank).
    fn split(&self, color: Option<u32>, key: usize) -> Result<Option<Self>>;

    /// Gather one u64 from every member; every member gets the full set,
    /// indexed by rank.
    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>>;

    /// Gather each member's element count at `root`. Returns
    /// `Some(counts)` (indexed by rank) at the root, `None` elsewhere.
    fn gather_counts(&self, count: usize, root: usize) -> Result<Option<Vec<usize>>>;

    /// Variable-count gather of u64 data at `root`, concatenated in rank
    /// order. The root must pass the member counts; other ranks pass
    /// `None` and receive `None`.
    fn gatherv_u64(
        &self,
        send: &[u64],
        counts: Option<&[usize]>,
        root: usize,
    ) -> Result<Option<Vec<u64>>>;

    /// Variable-count gather of f64 data at `root` (see `gatherv_u64`).
    fn gatherv_f64(
        &self,
        send: &[f64],
        counts: Option<&[usize]>,
        root: usize,
    ) -> Result<Option<Vec<f64>>>;

    /// Inverse of `gatherv_f64`: the root scatters contiguous per-member
    /// chunks of `send` (sized by `counts`) back; every member receives
    /// its chunk into `recv`.
    fn scatterv_f64(
        &self,
        send: Option<(&[f64], &[usize])>,
        recv: &mut [f64],
        root: usize,
    ) -> Result<()>;

    /// Broadcast a u64 from `root` to every member.
    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64>;

    /// Synchronization barrier.
    fn barrier(&self) -> Result<()>;
}
