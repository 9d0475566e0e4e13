//! Outbound contract with the accelerated solver engine.
//!
//! The bridge never looks inside the engine: it creates and destroys
//! handles, uploads the consolidated operator and vectors, triggers
//! setup/solve, and reads diagnostics. `reference` provides a CPU
//! implementation of the contract so the bridge runs end to end without
//! an accelerator library.

pub mod reference;

use std::fmt;
use std::str::FromStr;

use crate::error::{FunnelError, Result};

/// Precision/storage mode tag, selecting algorithmic behaviour entirely
/// inside the engine. First letter: where the solve runs (device/host);
/// the next two: matrix and vector scalar precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    DeviceDDI,
    DeviceDFI,
    DeviceFFI,
    HostDDI,
    HostDFI,
    HostFFI,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::DeviceDDI => "dDDI",
            Mode::DeviceDFI => "dDFI",
            Mode::DeviceFFI => "dFFI",
            Mode::HostDDI => "hDDI",
            Mode::HostDFI => "hDFI",
            Mode::HostFFI => "hFFI",
        }
    }

    /// Whether the solve runs on the accelerator device (as opposed to
    /// the engine's host fallback).
    pub fn device_resident(&self) -> bool {
        matches!(self, Mode::DeviceDDI | Mode::DeviceDFI | Mode::DeviceFFI)
    }
}

impl FromStr for Mode {
    type Err = FunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dDDI" => Ok(Mode::DeviceDDI),
            "dDFI" => Ok(Mode::DeviceDFI),
            "dFFI" => Ok(Mode::DeviceFFI),
            "hDDI" => Ok(Mode::HostDDI),
            "hDFI" => Ok(Mode::HostDFI),
            "hFFI" => Ok(Mode::HostFFI),
            other => Err(FunnelError::Mode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One member's contiguous global row range inside a consolidated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBlock {
    pub global_start: u64,
    pub rows: u64,
}

/// Row partition of a consolidated local block, in device-world rank
/// order. Handed to the engine at matrix upload so it can build its
/// halo maps; column indices stay in global numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub n_global_rows: u64,
    pub blocks: Vec<RowBlock>,
}

impl BlockLayout {
    /// Total rows in the consolidated block.
    pub fn local_rows(&self) -> usize {
        self.blocks.iter().map(|b| b.rows as usize).sum()
    }
}

/// The accelerated solver engine the bridge drives.
///
/// Handle lifecycles follow the bridge's, not the engine's: the shared
/// resource is created once per process by the first solver instance
/// (see `context::ResourcePool`), matrix/vector/solver handles are
/// created in set_operator and destroyed in finalize, and the library is
/// initialized before any resource exists and shut down after the last
/// one is gone.
pub trait Engine {
    type Resource;
    type Config;
    type Matrix;
    type Vector;
    type Solver;

    /// Number of accelerator devices this engine can see on the node.
    fn device_count(&self) -> Result<usize>;

    /// Global library bring-up. Called at most once per process.
    fn initialize_library(&self) -> Result<()>;

    /// Global library teardown, after all handles are destroyed.
    fn shutdown_library(&self) -> Result<()>;

    /// Parse a configuration resource. `source` is opaque to the bridge:
    /// a file path or inline configuration text, engine's choice.
    fn create_config(&self, source: &str) -> Result<Self::Config>;
    fn destroy_config(&self, config: Self::Config) -> Result<()>;

    /// Halo ring width the configuration implies for matrix uploads.
    fn ring_width(&self, config: &Self::Config) -> Result<usize>;

    /// Create the shared accelerator resource bound to one device.
    fn create_resources(&self, config: &Self::Config, device: usize) -> Result<Self::Resource>;
    fn destroy_resources(&self, resource: Self::Resource) -> Result<()>;

    fn create_matrix(&self, resource: &Self::Resource, mode: Mode) -> Result<Self::Matrix>;
    fn destroy_matrix(&self, matrix: Self::Matrix) -> Result<()>;

    fn create_vector(&self, resource: &Self::Resource, mode: Mode) -> Result<Self::Vector>;
    fn destroy_vector(&self, vector: Self::Vector) -> Result<()>;

    fn create_solver(
        &self,
        resource: &Self::Resource,
        mode: Mode,
        config: &Self::Config,
    ) -> Result<Self::Solver>;
    fn destroy_solver(&self, solver: Self::Solver) -> Result<()>;

    /// Upload a consolidated CSR block. `row_offsets` are local and
    /// contiguous, `col_indices` global; `layout` describes which global
    /// row ranges the block covers, `ring` the halo width.
    #[allow(clippy::too_many_arguments)]
    fn upload_matrix(
        &self,
        matrix: &mut Self::Matrix,
        layout: &BlockLayout,
        row_offsets: &[u64],
        col_indices: &[u64],
        values: &[f64],
        ring: usize,
    ) -> Result<()>;

    /// Replace coefficient values, structure unchanged.
    fn replace_values(&self, matrix: &mut Self::Matrix, values: &[f64]) -> Result<()>;

    /// Bind the solver to a matrix (full setup: partitioning, halo maps,
    /// preconditioner).
    fn bind(&self, solver: &mut Self::Solver, matrix: &Self::Matrix) -> Result<()>;

    /// Refresh a bound solver after `replace_values` (resetup: keeps
    /// structural metadata, rebuilds numeric state).
    fn rebind(&self, solver: &mut Self::Solver, matrix: &Self::Matrix) -> Result<()>;

    fn upload_vector(&self, vector: &mut Self::Vector, data: &[f64]) -> Result<()>;
    fn download_vector(&self, vector: &Self::Vector, out: &mut [f64]) -> Result<()>;

    /// Blocking solve: `p` holds the initial guess going in and the
    /// solution coming out; `b` is the right-hand side.
    fn solve(
        &self,
        solver: &mut Self::Solver,
        p: &mut Self::Vector,
        b: &Self::Vector,
    ) -> Result<()>;

    /// Iteration count of the last solve on this handle.
    fn iterations(&self, solver: &Self::Solver) -> Result<usize>;

    /// Residual recorded at `iteration` during the last solve. Index 0
    /// is the initial residual and the iteration count the final one, so
    /// valid indices are `0..=iterations`.
    fn residual(&self, solver: &Self::Solver, iteration: usize) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_strings() {
        for s in ["dDDI", "dDFI", "dFFI", "hDDI", "hDFI", "hFFI"] {
            let mode: Mode = s.parse().unwrap();
            assert_eq!(mode.as_str(), s);
            assert_eq!(mode.to_string(), s);
        }
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = "dDDl".parse::<Mode>().unwrap_err();
        assert!(matches!(err, FunnelError::Mode(_)));
        assert!("".parse::<Mode>().is_err());
    }

    #[test]
    fn device_residency_follows_first_letter() {
        assert!("dDDI".parse::<Mode>().unwrap().device_resident());
        assert!(!"hDDI".parse::<Mode>().unwrap().device_resident());
    }

    #[test]
    fn layout_sums_block_rows() {
        let layout = BlockLayout {
            n_global_rows: 10,
            blocks: vec![
                RowBlock { global_start: 0, rows: 3 },
                RowBlock { global_start: 7, rows: 2 },
            ],
        };
        assert_eq!(layout.local_rows(), 5);
    }
}
