//! In-process communicator.
//!
//! A `LocalCluster` hands out one endpoint per simulated rank; each rank
//! runs on its own thread and the endpoints rendezvous through a shared
//! exchange board. This is the degenerate single-process transport and
//! the harness the integration tests use to drive proxy and relay code
//! paths without an MPI launcher.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{FunnelError, Result};

use super::Communicator;

/// Rendezvous point for one communication group.
///
/// Implements a single primitive, `exchange`: every member deposits a
/// value, blocks until all members have deposited, and reads the full
/// set. All collectives are built on top of it. A two-phase protocol
/// (arrive, then depart) keeps back-to-back collectives from trampling
/// each other's slots.
struct Board {
    members: usize,
    state: Mutex<BoardState>,
    cv: Condvar,
}

struct BoardState {
    slots: Vec<Option<Box<dyn Any + Send>>>,
    arrived: usize,
    departed: usize,
}

impl Board {
    fn new(members: usize) -> Arc<Self> {
        Arc::new(Self {
            members,
            state: Mutex::new(BoardState {
                slots: (0..members).map(|_| None).collect(),
                arrived: 0,
                departed: 0,
            }),
            cv: Condvar::new(),
        })
    }

    fn exchange<T: Clone + Send + 'static>(&self, rank: usize, value: T) -> Vec<T> {
        let mut st = self.state.lock().expect("exchange board poisoned");

        // Wait for the previous round to drain before depositing.
        while st.arrived == self.members {
            st = self.cv.wait(st).expect("exchange board poisoned");
        }

        st.slots[rank] = Some(Box::new(value));
        st.arrived += 1;
        if st.arrived == self.members {
            self.cv.notify_all();
        }
        while st.arrived < self.members {
            st = self.cv.wait(st).expect("exchange board poisoned");
        }

        let out: Vec<T> = st
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .expect("slot deposited")
                    .downcast_ref::<T>()
                    .expect("mismatched collective call order across ranks")
                    .clone()
            })
            .collect();

        st.departed += 1;
        if st.departed == self.members {
            for slot in st.slots.iter_mut() {
                *slot = None;
            }
            st.arrived = 0;
            st.departed = 0;
            self.cv.notify_all();
        }
        out
    }
}

/// One rank's endpoint into an in-process communication group.
pub struct LocalComm {
    rank: usize,
    size: usize,
    node: String,
    board: Arc<Board>,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

/// Builder for sets of connected `LocalComm` endpoints.
pub struct LocalCluster;

impl LocalCluster {
    /// `size` endpoints, all reporting the same node identity.
    pub fn new(size: usize) -> Vec<LocalComm> {
        Self::with_nodes(&[("local", size)])
    }

    /// Endpoints spread over named simulated nodes, in rank order:
    /// `[("node0", 2), ("node1", 3)]` yields ranks 0-1 on node0 and
    /// ranks 2-4 on node1.
    pub fn with_nodes(nodes: &[(&str, usize)]) -> Vec<LocalComm> {
        let size: usize = nodes.iter().map(|(_, n)| n).sum();
        assert!(size > 0, "cluster must have at least one rank");
        let board = Board::new(size);

        let mut endpoints = Vec::with_capacity(size);
        let mut rank = 0;
        for (name, count) in nodes {
            for _ in 0..*count {
                endpoints.push(LocalComm {
                    rank,
                    size,
                    node: (*name).to_string(),
                    board: Arc::clone(&board),
                });
                rank += 1;
            }
        }
        endpoints
    }
}

impl LocalComm {
    /// Membership of each split group, grouped by color in first-seen
    /// order; members sorted by (key, parent rank).
    fn split_groups(entries: &[(Option<u32>, usize, usize)]) -> Vec<Vec<usize>> {
        let mut colors: Vec<u32> = Vec::new();
        for (color, _, _) in entries {
            if let Some(c) = color {
                if !colors.contains(c) {
                    colors.push(*c);
                }
            }
        }

        colors
            .iter()
            .map(|&c| {
                let mut members: Vec<(usize, usize)> = entries
                    .iter()
                    .filter(|(color, _, _)| *color == Some(c))
                    .map(|&(_, key, rank)| (key, rank))
                    .collect();
                members.sort();
                members.into_iter().map(|(_, rank)| rank).collect()
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn node_name(&self) -> String {
        self.node.clone()
    }

    fn duplicate(&self) -> Result<Self> {
        self.split(Some(0), self.rank)?
            .ok_or_else(|| FunnelError::Comm("duplicate produced no group".into()))
    }

    fn split(&self, color: Option<u32>, key: usize) -> Result<Option<Self>> {
        // Round 1: learn every rank's (color, key).
        let entries = self.board.exchange(self.rank, (color, key, self.rank));
        let groups = Self::split_groups(&entries);

        // Round 2: the lowest-ranked member of each group creates the
        // group's board; everyone else picks it out of that slot.
        let my_group = color.and_then(|_| {
            groups
                .iter()
                .find(|members| members.contains(&self.rank))
                .cloned()
        });
        let created: Option<Arc<Board>> = match &my_group {
            Some(members) if members.iter().min() == Some(&self.rank) => {
                Some(Board::new(members.len()))
            }
            _ => None,
        };
        let published = self.board.exchange(self.rank, created);

        let Some(members) = my_group else {
            return Ok(None);
        };
        let leader = *members.iter().min().expect("group is non-empty");
        let board = published[leader]
            .clone()
            .ok_or_else(|| FunnelError::Comm("split leader published no group board".into()))?;
        let new_rank = members
            .iter()
            .position(|&r| r == self.rank)
            .expect("member of own group");

        Ok(Some(LocalComm {
            rank: new_rank,
            size: members.len(),
            node: self.node.clone(),
            board,
        }))
    }

    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>> {
        Ok(self.board.exchange(self.rank, value))
    }

    fn gather_counts(&self, count: usize, root: usize) -> Result<Option<Vec<usize>>> {
        let all = self.board.exchange(self.rank, count as u64);
        if self.rank == root {
            Ok(Some(all.into_iter().map(|c| c as usize).collect()))
        } else {
            Ok(None)
        }
    }

    fn gatherv_u64(
        &self,
        send: &[u64],
        counts: Option<&[usize]>,
        root: usize,
    ) -> Result<Option<Vec<u64>>> {
        let all = self.board.exchange(self.rank, send.to_vec());
        if self.rank != root {
            return Ok(None);
        }
        let counts =
            counts.ok_or_else(|| FunnelError::Comm("gatherv root requires member counts".into()))?;
        for (rank, chunk) in all.iter().enumerate() {
            if chunk.len() != counts[rank] {
                return Err(FunnelError::Comm(format!(
                    "gatherv count mismatch from rank {rank}: sent {}, expected {}",
                    chunk.len(),
                    counts[rank]
                )));
            }
        }
        Ok(Some(all.concat()))
    }

    fn gatherv_f64(
        &self,
        send: &[f64],
        counts: Option<&[usize]>,
        root: usize,
    ) -> Result<Option<Vec<f64>>> {
        let all = self.board.exchange(self.rank, send.to_vec());
        if self.rank != root {
            return Ok(None);
        }
        let counts =
            counts.ok_or_else(|| FunnelError::Comm("gatherv root requires member counts".into()))?;
        for (rank, chunk) in all.iter().enumerate() {
            if chunk.len() != counts[rank] {
                return Err(FunnelError::Comm(format!(
                    "gatherv count mismatch from rank {rank}: sent {}, expected {}",
                    chunk.len(),
                    counts[rank]
                )));
            }
        }
        Ok(Some(all.concat()))
    }

    fn scatterv_f64(
        &self,
        send: Option<(&[f64], &[usize])>,
        recv: &mut [f64],
        root: usize,
    ) -> Result<()> {
        let chunks: Option<Vec<Vec<f64>>> = match send {
            Some((data, counts)) => {
                let total: usize = counts.iter().sum();
                if total != data.len() {
                    return Err(FunnelError::Comm(format!(
                        "scatterv counts sum to {total} but buffer holds {}",
                        data.len()
                    )));
                }
                let mut chunks = Vec::with_capacity(counts.len());
                let mut offset = 0;
                for &c in counts {
                    chunks.push(data[offset..offset + c].to_vec());
                    offset += c;
                }
                Some(chunks)
            }
            None => None,
        };

        let published = self.board.exchange(self.rank, chunks);
        let from_root = published[root]
            .as_ref()
            .ok_or_else(|| FunnelError::Comm("scatterv root supplied no data".into()))?;
        let mine = &from_root[self.rank];
        if mine.len() != recv.len() {
            return Err(FunnelError::Comm(format!(
                "scatterv chunk for rank {} holds {} values, receive buffer holds {}",
                self.rank,
                mine.len(),
                recv.len()
            )));
        }
        recv.copy_from_slice(mine);
        Ok(())
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64> {
        let published = self.board.exchange(
            self.rank,
            if self.rank == root { Some(value) } else { None },
        );
        published[root]
            .ok_or_else(|| FunnelError::Comm("broadcast root supplied no value".into()))
    }

    fn barrier(&self) -> Result<()> {
        self.board.exchange(self.rank, ());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ranks<F>(endpoints: Vec<LocalComm>, f: F)
    where
        F: Fn(LocalComm) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|comm| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(comm))
            })
            .collect();
        for h in handles {
            h.join().expect("rank thread panicked");
        }
    }

    #[test]
    fn single_rank_collectives_are_trivial() {
        let comm = LocalCluster::new(1).pop().unwrap();
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        assert_eq!(comm.allgather_u64(7).unwrap(), vec![7]);
        assert_eq!(comm.broadcast_u64(3, 0).unwrap(), 3);
        comm.barrier().unwrap();
    }

    #[test]
    fn allgather_orders_by_rank() {
        run_ranks(LocalCluster::new(4), |comm| {
            let all = comm.allgather_u64(comm.rank() as u64 * 10).unwrap();
            assert_eq!(all, vec![0, 10, 20, 30]);
        });
    }

    #[test]
    fn gatherv_concatenates_in_rank_order() {
        run_ranks(LocalCluster::new(3), |comm| {
            let mine: Vec<f64> = (0..comm.rank() + 1).map(|i| i as f64).collect();
            let counts = comm.gather_counts(mine.len(), 0).unwrap();
            let gathered = comm.gatherv_f64(&mine, counts.as_deref(), 0).unwrap();
            if comm.rank() == 0 {
                assert_eq!(gathered.unwrap(), vec![0.0, 0.0, 1.0, 0.0, 1.0, 2.0]);
            } else {
                assert!(gathered.is_none());
            }
        });
    }

    #[test]
    fn scatterv_round_trips_gatherv() {
        run_ranks(LocalCluster::new(3), |comm| {
            let mine = vec![comm.rank() as f64; comm.rank() + 1];
            let counts = comm.gather_counts(mine.len(), 0).unwrap();
            let gathered = comm.gatherv_f64(&mine, counts.as_deref(), 0).unwrap();

            let mut back = vec![0.0; mine.len()];
            let send = gathered
                .as_ref()
                .map(|data| (data.as_slice(), counts.as_deref().unwrap()));
            comm.scatterv_f64(send, &mut back, 0).unwrap();
            assert_eq!(back, mine);
        });
    }

    #[test]
    fn split_reranks_members_by_key() {
        run_ranks(LocalCluster::new(4), |comm| {
            // Even ranks to color 0, odd ranks to color 1; reverse key
            // order so the highest parent rank becomes rank 0.
            let color = Some((comm.rank() % 2) as u32);
            let key = comm.size() - comm.rank();
            let sub = comm.split(color, key).unwrap().unwrap();
            assert_eq!(sub.size(), 2);
            let expected = if comm.rank() >= 2 { 0 } else { 1 };
            assert_eq!(sub.rank(), expected);

            // The sub-group is a working communicator of its own.
            let all = sub.allgather_u64(comm.rank() as u64).unwrap();
            let parity = (comm.rank() % 2) as u64;
            assert_eq!(all, vec![parity + 2, parity]);
        });
    }

    #[test]
    fn split_with_undefined_color_opts_out() {
        run_ranks(LocalCluster::new(3), |comm| {
            let color = if comm.rank() == 2 { None } else { Some(0) };
            let sub = comm.split(color, comm.rank()).unwrap();
            if comm.rank() == 2 {
                assert!(sub.is_none());
            } else {
                assert_eq!(sub.unwrap().size(), 2);
            }
        });
    }

    #[test]
    fn node_names_follow_cluster_layout() {
        let endpoints = LocalCluster::with_nodes(&[("a", 1), ("b", 2)]);
        let names: Vec<String> = endpoints.iter().map(|c| c.node_name()).collect();
        assert_eq!(names, vec!["a", "b", "b"]);
    }
}
