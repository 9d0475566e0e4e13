//! MPI transport for the gather-solve-scatter protocol.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::world().expect("no processor name");
//! ```

use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::{Communicator as RawCommunicator, CommunicatorCollectives, Root};
use mpi::Count;

use crate::error::{FunnelError, Result};

use super::Communicator;

/// MPI-backed communicator handle.
pub struct MpiComm {
    raw: SimpleCommunicator,
    node: String,
}

impl MpiComm {
    /// Wrap the MPI world communicator. Panics if MPI has not been
    /// initialized via `mpi::initialize()`.
    pub fn world() -> Result<Self> {
        let node = mpi::environment::processor_name()
            .map_err(|e| FunnelError::Comm(format!("querying processor name: {e:?}")))?;
        Ok(Self {
            raw: SimpleCommunicator::world(),
            node,
        })
    }

    fn wrap(&self, raw: SimpleCommunicator) -> Self {
        Self {
            raw,
            node: self.node.clone(),
        }
    }

    fn displacements(counts: &[Count]) -> Vec<Count> {
        let mut displs = Vec::with_capacity(counts.len());
        let mut offset: Count = 0;
        for &c in counts {
            displs.push(offset);
            offset += c;
        }
        displs
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.raw.rank() as usize
    }

    fn size(&self) -> usize {
        self.raw.size() as usize
    }

    fn node_name(&self) -> String {
        self.node.clone()
    }

    fn duplicate(&self) -> Result<Self> {
        Ok(self.wrap(self.raw.duplicate()))
    }

    fn split(&self, color: Option<u32>, key: usize) -> Result<Option<Self>> {
        let color = match color {
            Some(c) => Color::with_value(c as i32),
            None => Color::undefined(),
        };
        Ok(self
            .raw
            .split_by_color_with_key(color, key as i32)
            .map(|raw| self.wrap(raw)))
    }

    fn allgather_u64(&self, value: u64) -> Result<Vec<u64>> {
        let mut out = vec![0u64; self.size()];
        self.raw.all_gather_into(&value, &mut out[..]);
        Ok(out)
    }

    fn gather_counts(&self, count: usize, root: usize) -> Result<Option<Vec<usize>>> {
        let mine = count as u64;
        let root_proc = self.raw.process_at_rank(root as i32);
        if self.rank() == root {
            let mut out = vec![0u64; self.size()];
            root_proc.gather_into_root(&mine, &mut out[..]);
            Ok(Some(out.into_iter().map(|c| c as usize).collect()))
        } else {
            root_proc.gather_into(&mine);
            Ok(None)
        }
    }

    fn gatherv_u64(
        &self,
        send: &[u64],
        counts: Option<&[usize]>,
        root: usize,
    ) -> Result<Option<Vec<u64>>> {
        let root_proc = self.raw.process_at_rank(root as i32);
        if self.rank() != root {
            root_proc.gather_varcount_into(send);
            return Ok(None);
        }
        let counts =
            counts.ok_or_else(|| FunnelError::Comm("gatherv root requires member counts".into()))?;
        let counts: Vec<Count> = counts.iter().map(|&c| c as Count).collect();
        let displs = Self::displacements(&counts);
        let total: usize = counts.iter().map(|&c| c as usize).sum();
        let mut buf = vec![0u64; total];
        {
            let mut partition = PartitionMut::new(&mut buf[..], counts, displs);
            root_proc.gather_varcount_into_root(send, &mut partition);
        }
        Ok(Some(buf))
    }

    fn gatherv_f64(
        &self,
        send: &[f64],
        counts: Option<&[usize]>,
        root: usize,
    ) -> Result<Option<Vec<f64>>> {
        let root_proc = self.raw.process_at_rank(root as i32);
        if self.rank() != root {
            root_proc.gather_varcount_into(send);
            return Ok(None);
        }
        let counts =
            counts.ok_or_else(|| FunnelError::Comm("gatherv root requires member counts".into()))?;
        let counts: Vec<Count> = counts.iter().map(|&c| c as Count).collect();
        let displs = Self::displacements(&counts);
        let total: usize = counts.iter().map(|&c| c as usize).sum();
        let mut buf = vec![0.0f64; total];
        {
            let mut partition = PartitionMut::new(&mut buf[..], counts, displs);
            root_proc.gather_varcount_into_root(send, &mut partition);
        }
        Ok(Some(buf))
    }

    fn scatterv_f64(
        &self,
        send: Option<(&[f64], &[usize])>,
        recv: &mut [f64],
        root: usize,
    ) -> Result<()> {
        let root_proc = self.raw.process_at_rank(root as i32);
        if self.rank() != root {
            root_proc.scatter_varcount_into(recv);
            return Ok(());
        }
        let (data, counts) = send
            .ok_or_else(|| FunnelError::Comm("scatterv root requires data and counts".into()))?;
        let counts: Vec<Count> = counts.iter().map(|&c| c as Count).collect();
        let displs = Self::displacements(&counts);
        let partition = Partition::new(data, counts, displs);
        root_proc.scatter_varcount_into_root(&partition, recv);
        Ok(())
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64> {
        let mut value = value;
        self.raw
            .process_at_rank(root as i32)
            .broadcast_into(&mut value);
        Ok(value)
    }

    fn barrier(&self) -> Result<()> {
        self.raw.barrier();
        Ok(())
    }
}
