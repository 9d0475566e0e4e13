//! CSR fragment consolidation.
//!
//! Pure helpers for merging the row fragments a device world contributes
//! into one contiguous local block at the proxy. Row offsets are
//! renumbered to a single local range; column indices are left in global
//! numbering for the engine's halo-exchange setup.

use crate::engine::{BlockLayout, RowBlock};
use crate::error::{FunnelError, Result};

/// Borrowed view of one rank's CSR fragment, as supplied by the matrix
/// adapter. Column indices are global; row offsets are local to the
/// fragment. Never mutated by the bridge.
#[derive(Debug, Clone, Copy)]
pub struct CsrSlice<'a> {
    pub row_offsets: &'a [usize],
    pub col_indices: &'a [u64],
    pub values: &'a [f64],
}

impl CsrSlice<'_> {
    /// Validate the fragment against the counts the caller declared.
    pub fn check(&self, n_local_rows: usize, n_local_nz: usize) -> Result<()> {
        if self.row_offsets.len() != n_local_rows + 1 {
            return Err(FunnelError::Usage(format!(
                "row offsets hold {} entries for {} local rows",
                self.row_offsets.len(),
                n_local_rows
            )));
        }
        if self.row_offsets[0] != 0 || self.row_offsets[n_local_rows] != n_local_nz {
            return Err(FunnelError::Usage(format!(
                "row offsets span {}..{}, expected 0..{n_local_nz}",
                self.row_offsets[0], self.row_offsets[n_local_rows]
            )));
        }
        if self.col_indices.len() != n_local_nz || self.values.len() != n_local_nz {
            return Err(FunnelError::Usage(format!(
                "{} column indices and {} values for {n_local_nz} nonzeros",
                self.col_indices.len(),
                self.values.len()
            )));
        }
        Ok(())
    }

    /// Per-row nonzero counts, the form row structure travels in.
    pub fn row_lengths(&self) -> Vec<u64> {
        self.row_offsets
            .windows(2)
            .map(|w| (w[1] - w[0]) as u64)
            .collect()
    }
}

/// Rebuild contiguous row offsets from the concatenated per-row lengths
/// of every device-world member, in rank order.
pub fn merge_offsets(row_lengths: &[u64]) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(row_lengths.len() + 1);
    let mut total = 0u64;
    offsets.push(0);
    for &len in row_lengths {
        total += len;
        offsets.push(total);
    }
    offsets
}

/// Assemble the consolidated block's row partition from the gathered
/// `(global_start, rows)` pairs, one per member in rank order.
pub fn merge_layout(n_global_rows: u64, spans: &[u64]) -> Result<BlockLayout> {
    if spans.len() % 2 != 0 {
        return Err(FunnelError::Comm(format!(
            "gathered {} row-span words, expected pairs",
            spans.len()
        )));
    }
    let blocks: Vec<RowBlock> = spans
        .chunks_exact(2)
        .map(|pair| RowBlock {
            global_start: pair[0],
            rows: pair[1],
        })
        .collect();
    for block in &blocks {
        if block.global_start + block.rows > n_global_rows {
            return Err(FunnelError::Usage(format!(
                "row block {}..{} exceeds the {} global rows",
                block.global_start,
                block.global_start + block.rows,
                n_global_rows
            )));
        }
    }
    Ok(BlockLayout {
        n_global_rows,
        blocks,
    })
}

/// Each rank's global row start under the contiguous-by-rank layout,
/// from the allgathered local row counts.
pub fn row_starts(row_counts: &[u64]) -> Vec<u64> {
    let mut starts = Vec::with_capacity(row_counts.len());
    let mut offset = 0u64;
    for &count in row_counts {
        starts.push(offset);
        offset += count;
    }
    starts
}
