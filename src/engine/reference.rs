//! CPU reference implementation of the engine contract.
//!
//! Solves the consolidated block with BiCGSTAB on the host. It supports
//! block-closed systems only: every column index must fall inside one of
//! the block's own row ranges, so inter-device coupling is rejected at
//! upload. That is enough to exercise the whole bridge (topology,
//! lifecycle, consolidation, gather-solve-scatter) without a GPU, and
//! the lifecycle counters it keeps make the shared-resource invariants
//! observable in tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use serde::Deserialize;

use crate::error::{FunnelError, Result};

use super::{BlockLayout, Engine, Mode};

/// Knobs of the reference solve, parsed from the configuration resource
/// (TOML, inline or a file path).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolveSettings {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub ring_width: usize,
}

impl Default for SolveSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 1000,
            ring_width: 1,
        }
    }
}

/// Lifecycle counters, readable at any time through
/// `ReferenceEngine::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub library_inits: u32,
    pub library_shutdowns: u32,
    pub resources_created: u32,
    pub resources_destroyed: u32,
    pub configs_created: u32,
    pub configs_destroyed: u32,
    pub solves: u32,
}

struct EngineState {
    library_up: bool,
    stats: EngineStats,
}

/// Cheap to clone; clones share device inventory and counters.
#[derive(Clone)]
pub struct ReferenceEngine {
    devices: usize,
    state: Rc<RefCell<EngineState>>,
}

impl ReferenceEngine {
    /// One simulated device.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// Simulate a node with `devices` accelerator devices.
    pub fn with_devices(devices: usize) -> Self {
        Self {
            devices,
            state: Rc::new(RefCell::new(EngineState {
                library_up: false,
                stats: EngineStats::default(),
            })),
        }
    }

    /// Use the real adapter inventory of this node (at least one, so the
    /// reference engine stays usable on headless machines).
    pub fn autodetect() -> Self {
        Self::with_devices(crate::device::visible_device_count().max(1))
    }

    pub fn stats(&self) -> EngineStats {
        self.state.borrow().stats
    }
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Lease on one simulated device; the shared resource handle.
pub struct DeviceLease {
    pub device: usize,
}

/// CSR block with column indices remapped to consolidated-local numbering.
#[derive(Clone)]
struct LocalBlock {
    n: usize,
    row_offsets: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl LocalBlock {
    fn spmv(&self, x: &[f64], y: &mut [f64]) {
        for row in 0..self.n {
            let mut sum = 0.0;
            for idx in self.row_offsets[row]..self.row_offsets[row + 1] {
                sum += self.values[idx] * x[self.cols[idx]];
            }
            y[row] = sum;
        }
    }
}

pub struct HostMatrix {
    #[allow(dead_code)]
    mode: Mode,
    block: Option<LocalBlock>,
}

pub struct HostVector {
    data: Vec<f64>,
}

pub struct KrylovState {
    settings: SolveSettings,
    block: Option<LocalBlock>,
    iterations: usize,
    residuals: Vec<f64>,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// Unpreconditioned BiCGSTAB; returns the iteration count and the
/// residual history. `residuals[0]` is the initial residual norm and
/// `residuals[i]` the norm after iteration `i`, so the history holds
/// `iterations + 1` entries and the final residual sits at index
/// `iterations`. Breakdown or hitting the iteration cap just ends the
/// loop: non-convergence is reported through the diagnostics accessors,
/// never as an error.
fn bicgstab(
    a: &LocalBlock,
    b: &[f64],
    x: &mut [f64],
    settings: &SolveSettings,
) -> (usize, Vec<f64>) {
    let n = a.n;
    let mut residuals = Vec::new();

    let mut r = vec![0.0; n];
    a.spmv(x, &mut r);
    for i in 0..n {
        r[i] = b[i] - r[i];
    }
    let r_hat = r.clone();

    let b_norm = dot(b, b).sqrt();
    if b_norm < 1e-300 {
        x.fill(0.0);
        residuals.push(0.0);
        return (0, residuals);
    }
    let abs_tol = settings.tolerance * b_norm;
    let r0_norm = dot(&r, &r).sqrt();
    residuals.push(r0_norm);
    if r0_norm < abs_tol {
        return (0, residuals);
    }

    let mut p = vec![0.0; n];
    let mut v = vec![0.0; n];
    let mut s = vec![0.0; n];
    let mut t = vec![0.0; n];
    let mut rho = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;

    for iter in 0..settings.max_iterations {
        let rho_new = dot(&r_hat, &r);
        if rho_new.abs() < 1e-300 {
            tracing::warn!(iter, "reference BiCGSTAB breakdown: rho ~ 0");
            break;
        }
        let beta = (rho_new / rho) * (alpha / omega);
        rho = rho_new;

        for i in 0..n {
            p[i] = r[i] + beta * (p[i] - omega * v[i]);
        }
        a.spmv(&p, &mut v);

        let r_hat_dot_v = dot(&r_hat, &v);
        if r_hat_dot_v.abs() < 1e-300 {
            tracing::warn!(iter, "reference BiCGSTAB breakdown: r_hat.v ~ 0");
            break;
        }
        alpha = rho / r_hat_dot_v;

        s.copy_from_slice(&r);
        axpy(-alpha, &v, &mut s);

        let s_norm = dot(&s, &s).sqrt();
        if s_norm < abs_tol {
            axpy(alpha, &p, x);
            residuals.push(s_norm);
            return (iter + 1, residuals);
        }

        a.spmv(&s, &mut t);
        let t_dot_t = dot(&t, &t);
        if t_dot_t.abs() < 1e-300 {
            tracing::warn!(iter, "reference BiCGSTAB breakdown: ||t|| ~ 0");
            break;
        }
        omega = dot(&t, &s) / t_dot_t;

        axpy(alpha, &p, x);
        axpy(omega, &s, x);

        r.copy_from_slice(&s);
        axpy(-omega, &t, &mut r);

        let r_norm = dot(&r, &r).sqrt();
        residuals.push(r_norm);
        if !r_norm.is_finite() {
            tracing::warn!(iter, "reference BiCGSTAB diverged");
            return (iter + 1, residuals);
        }
        if r_norm < abs_tol {
            tracing::debug!(iterations = iter + 1, "reference BiCGSTAB converged");
            return (iter + 1, residuals);
        }
        if omega.abs() < 1e-300 {
            tracing::warn!(iter, "reference BiCGSTAB breakdown: omega ~ 0");
            break;
        }
    }

    (residuals.len() - 1, residuals)
}

impl Engine for ReferenceEngine {
    type Resource = DeviceLease;
    type Config = SolveSettings;
    type Matrix = HostMatrix;
    type Vector = HostVector;
    type Solver = KrylovState;

    fn device_count(&self) -> Result<usize> {
        Ok(self.devices)
    }

    fn initialize_library(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.library_up {
            return Err(FunnelError::Engine(
                "reference library initialized twice".into(),
            ));
        }
        state.library_up = true;
        state.stats.library_inits += 1;
        Ok(())
    }

    fn shutdown_library(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.library_up {
            return Err(FunnelError::Engine(
                "reference library shut down while not initialized".into(),
            ));
        }
        state.library_up = false;
        state.stats.library_shutdowns += 1;
        Ok(())
    }

    fn create_config(&self, source: &str) -> Result<SolveSettings> {
        let text = if source.is_empty() {
            String::new()
        } else if Path::new(source).is_file() {
            std::fs::read_to_string(source)?
        } else {
            source.to_string()
        };
        let settings = toml::from_str(&text).map_err(|e| FunnelError::Config(e.to_string()))?;
        self.state.borrow_mut().stats.configs_created += 1;
        Ok(settings)
    }

    fn destroy_config(&self, _config: SolveSettings) -> Result<()> {
        self.state.borrow_mut().stats.configs_destroyed += 1;
        Ok(())
    }

    fn ring_width(&self, config: &SolveSettings) -> Result<usize> {
        Ok(config.ring_width)
    }

    fn create_resources(&self, _config: &SolveSettings, device: usize) -> Result<DeviceLease> {
        if device >= self.devices {
            return Err(FunnelError::Engine(format!(
                "device {device} out of range (node has {})",
                self.devices
            )));
        }
        self.state.borrow_mut().stats.resources_created += 1;
        Ok(DeviceLease { device })
    }

    fn destroy_resources(&self, _resource: DeviceLease) -> Result<()> {
        self.state.borrow_mut().stats.resources_destroyed += 1;
        Ok(())
    }

    fn create_matrix(&self, _resource: &DeviceLease, mode: Mode) -> Result<HostMatrix> {
        Ok(HostMatrix { mode, block: None })
    }

    fn destroy_matrix(&self, _matrix: HostMatrix) -> Result<()> {
        Ok(())
    }

    fn create_vector(&self, _resource: &DeviceLease, _mode: Mode) -> Result<HostVector> {
        Ok(HostVector { data: Vec::new() })
    }

    fn destroy_vector(&self, _vector: HostVector) -> Result<()> {
        Ok(())
    }

    fn create_solver(
        &self,
        _resource: &DeviceLease,
        _mode: Mode,
        config: &SolveSettings,
    ) -> Result<KrylovState> {
        Ok(KrylovState {
            settings: config.clone(),
            block: None,
            iterations: 0,
            residuals: Vec::new(),
        })
    }

    fn destroy_solver(&self, _solver: KrylovState) -> Result<()> {
        Ok(())
    }

    fn upload_matrix(
        &self,
        matrix: &mut HostMatrix,
        layout: &BlockLayout,
        row_offsets: &[u64],
        col_indices: &[u64],
        values: &[f64],
        _ring: usize,
    ) -> Result<()> {
        let n = layout.local_rows();
        if row_offsets.len() != n + 1 {
            return Err(FunnelError::Engine(format!(
                "row offsets hold {} entries for {} rows",
                row_offsets.len(),
                n
            )));
        }

        // Global row index -> position inside the consolidated block.
        let mut global_to_local: HashMap<u64, usize> = HashMap::new();
        let mut local = 0usize;
        for block in &layout.blocks {
            for g in block.global_start..block.global_start + block.rows {
                global_to_local.insert(g, local);
                local += 1;
            }
        }

        let cols = col_indices
            .iter()
            .map(|c| {
                global_to_local.get(c).copied().ok_or_else(|| {
                    FunnelError::Engine(format!(
                        "column {c} couples outside the local block; the reference \
                         engine supports block-closed systems only"
                    ))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        matrix.block = Some(LocalBlock {
            n,
            row_offsets: row_offsets.iter().map(|&o| o as usize).collect(),
            cols,
            values: values.to_vec(),
        });
        Ok(())
    }

    fn replace_values(&self, matrix: &mut HostMatrix, values: &[f64]) -> Result<()> {
        let block = matrix
            .block
            .as_mut()
            .ok_or_else(|| FunnelError::Engine("replace_values before upload".into()))?;
        if values.len() != block.values.len() {
            return Err(FunnelError::Engine(format!(
                "value count changed from {} to {}",
                block.values.len(),
                values.len()
            )));
        }
        block.values.copy_from_slice(values);
        Ok(())
    }

    fn bind(&self, solver: &mut KrylovState, matrix: &HostMatrix) -> Result<()> {
        let block = matrix
            .block
            .as_ref()
            .ok_or_else(|| FunnelError::Engine("bind before matrix upload".into()))?;
        solver.block = Some(block.clone());
        Ok(())
    }

    fn rebind(&self, solver: &mut KrylovState, matrix: &HostMatrix) -> Result<()> {
        self.bind(solver, matrix)
    }

    fn upload_vector(&self, vector: &mut HostVector, data: &[f64]) -> Result<()> {
        vector.data.clear();
        vector.data.extend_from_slice(data);
        Ok(())
    }

    fn download_vector(&self, vector: &HostVector, out: &mut [f64]) -> Result<()> {
        if out.len() != vector.data.len() {
            return Err(FunnelError::Engine(format!(
                "downloading {} values into a buffer of {}",
                vector.data.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&vector.data);
        Ok(())
    }

    fn solve(&self, solver: &mut KrylovState, p: &mut HostVector, b: &HostVector) -> Result<()> {
        let block = solver
            .block
            .as_ref()
            .ok_or_else(|| FunnelError::Engine("solve before bind".into()))?;
        if p.data.len() != block.n || b.data.len() != block.n {
            return Err(FunnelError::Engine(format!(
                "vector length {} does not match block size {}",
                p.data.len(),
                block.n
            )));
        }
        let (iterations, residuals) = bicgstab(block, &b.data, &mut p.data, &solver.settings);
        solver.iterations = iterations;
        solver.residuals = residuals;
        self.state.borrow_mut().stats.solves += 1;
        Ok(())
    }

    fn iterations(&self, solver: &KrylovState) -> Result<usize> {
        Ok(solver.iterations)
    }

    fn residual(&self, solver: &KrylovState, iteration: usize) -> Result<f64> {
        solver.residuals.get(iteration).copied().ok_or_else(|| {
            FunnelError::Usage(format!(
                "residual requested for iteration {iteration}, last solve ran {}",
                solver.iterations
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn diag_block(values: &[f64]) -> (BlockLayout, Vec<u64>, Vec<u64>, Vec<f64>) {
        let n = values.len() as u64;
        let layout = BlockLayout {
            n_global_rows: n,
            blocks: vec![super::super::RowBlock {
                global_start: 0,
                rows: n,
            }],
        };
        let offsets: Vec<u64> = (0..=n).collect();
        let cols: Vec<u64> = (0..n).collect();
        (layout, offsets, cols, values.to_vec())
    }

    fn uploaded(engine: &ReferenceEngine, values: &[f64]) -> (HostMatrix, KrylovState, DeviceLease) {
        let cfg = engine.create_config("").unwrap();
        let lease = engine.create_resources(&cfg, 0).unwrap();
        let mut matrix = engine.create_matrix(&lease, Mode::DeviceDDI).unwrap();
        let mut solver = engine
            .create_solver(&lease, Mode::DeviceDDI, &cfg)
            .unwrap();
        let (layout, offsets, cols, vals) = diag_block(values);
        engine
            .upload_matrix(&mut matrix, &layout, &offsets, &cols, &vals, 1)
            .unwrap();
        engine.bind(&mut solver, &matrix).unwrap();
        (matrix, solver, lease)
    }

    #[test]
    fn config_parses_inline_toml_and_defaults() {
        let engine = ReferenceEngine::new();
        let cfg = engine.create_config("tolerance = 1e-4\n").unwrap();
        assert_relative_eq!(cfg.tolerance, 1e-4);
        assert_eq!(cfg.max_iterations, 1000);

        let cfg = engine.create_config("").unwrap();
        assert_relative_eq!(cfg.tolerance, 1e-8);
        assert!(engine.create_config("not toml at all [").is_err());
    }

    #[test]
    fn diagonal_system_converges_in_one_iteration() {
        let engine = ReferenceEngine::new();
        let (_matrix, mut solver, _lease) = uploaded(&engine, &[2.0, 2.0, 2.0, 2.0]);

        let mut p = HostVector {
            data: vec![0.0; 4],
        };
        let b = HostVector {
            data: vec![2.0; 4],
        };
        engine.solve(&mut solver, &mut p, &b).unwrap();

        for v in &p.data {
            assert_relative_eq!(*v, 1.0, epsilon = 1e-8);
        }
        assert_eq!(engine.iterations(&solver).unwrap(), 1);
        // History spans 0..=iterations: initial residual, then one per
        // iteration.
        assert_relative_eq!(engine.residual(&solver, 0).unwrap(), 4.0);
        assert!(engine.residual(&solver, 1).unwrap() < 1e-8);
        assert!(matches!(
            engine.residual(&solver, 5),
            Err(FunnelError::Usage(_))
        ));
    }

    #[test]
    fn tridiagonal_spd_system_converges() {
        // [[4,-1,0],[-1,4,-1],[0,-1,4]] x = [1,2,3]
        let engine = ReferenceEngine::new();
        let cfg = engine.create_config("").unwrap();
        let lease = engine.create_resources(&cfg, 0).unwrap();
        let mut matrix = engine.create_matrix(&lease, Mode::DeviceDDI).unwrap();
        let mut solver = engine.create_solver(&lease, Mode::DeviceDDI, &cfg).unwrap();

        let layout = BlockLayout {
            n_global_rows: 3,
            blocks: vec![super::super::RowBlock {
                global_start: 0,
                rows: 3,
            }],
        };
        engine
            .upload_matrix(
                &mut matrix,
                &layout,
                &[0, 2, 5, 7],
                &[0, 1, 0, 1, 2, 1, 2],
                &[4.0, -1.0, -1.0, 4.0, -1.0, -1.0, 4.0],
                1,
            )
            .unwrap();
        engine.bind(&mut solver, &matrix).unwrap();

        let mut p = HostVector { data: vec![0.0; 3] };
        let b = HostVector {
            data: vec![1.0, 2.0, 3.0],
        };
        engine.solve(&mut solver, &mut p, &b).unwrap();

        // Check A x = b.
        let block = solver.block.as_ref().unwrap();
        let mut ax = vec![0.0; 3];
        block.spmv(&p.data, &mut ax);
        for (axi, bi) in ax.iter().zip(&b.data) {
            assert_relative_eq!(*axi, *bi, epsilon = 1e-6);
        }
        assert!(engine.iterations(&solver).unwrap() > 0);
    }

    #[test]
    fn replace_values_requires_matching_structure() {
        let engine = ReferenceEngine::new();
        let (mut matrix, mut solver, _lease) = uploaded(&engine, &[2.0, 2.0]);

        engine.replace_values(&mut matrix, &[4.0, 4.0]).unwrap();
        engine.rebind(&mut solver, &matrix).unwrap();

        let mut p = HostVector { data: vec![0.0; 2] };
        let b = HostVector { data: vec![2.0; 2] };
        engine.solve(&mut solver, &mut p, &b).unwrap();
        assert_relative_eq!(p.data[0], 0.5, epsilon = 1e-8);

        assert!(engine.replace_values(&mut matrix, &[1.0]).is_err());
    }

    #[test]
    fn foreign_columns_are_rejected() {
        let engine = ReferenceEngine::new();
        let cfg = engine.create_config("").unwrap();
        let lease = engine.create_resources(&cfg, 0).unwrap();
        let mut matrix = engine.create_matrix(&lease, Mode::DeviceDDI).unwrap();
        let layout = BlockLayout {
            n_global_rows: 8,
            blocks: vec![super::super::RowBlock {
                global_start: 0,
                rows: 2,
            }],
        };
        // Column 5 lives outside rows 0..2.
        let err = engine
            .upload_matrix(&mut matrix, &layout, &[0, 1, 2], &[0, 5], &[1.0, 1.0], 1)
            .unwrap_err();
        assert!(matches!(err, FunnelError::Engine(_)));
    }

    #[test]
    fn lifecycle_counters_track_library_and_resources() {
        let engine = ReferenceEngine::with_devices(2);
        assert_eq!(engine.device_count().unwrap(), 2);

        engine.initialize_library().unwrap();
        assert!(engine.initialize_library().is_err());
        let cfg = engine.create_config("").unwrap();
        let lease = engine.create_resources(&cfg, 1).unwrap();
        assert!(engine.create_resources(&cfg, 2).is_err());
        engine.destroy_resources(lease).unwrap();
        engine.shutdown_library().unwrap();
        assert!(engine.shutdown_library().is_err());

        let stats = engine.stats();
        assert_eq!(stats.library_inits, 1);
        assert_eq!(stats.library_shutdowns, 1);
        assert_eq!(stats.resources_created, 1);
        assert_eq!(stats.resources_destroyed, 1);
    }
}
