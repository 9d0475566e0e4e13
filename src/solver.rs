//! The solver instance: operator setup, gather-solve-scatter, and
//! diagnostics.
//!
//! One `Solver` wraps one logical linear system. At initialization it
//! builds the communicator hierarchy and registers with the process-wide
//! resource pool; `set_operator` consolidates the device world's CSR
//! fragments at the proxy and uploads them once; every `solve` gathers
//! the right-hand side and initial guess, runs the engine's blocking
//! solve on the proxy, and scatters the solution back, so repeated
//! solves on an unchanged matrix touch vectors only.

use std::rc::Rc;

use crate::comm::Communicator;
use crate::consolidate::{self, CsrSlice};
use crate::context::ResourcePool;
use crate::engine::{Engine, Mode};
use crate::error::{FunnelError, Result};
use crate::topology::{self, CommunicatorSet, ProcessTopology, Role};

/// Engine-side handles held by device-owning processes only.
struct GpuSide<E: Engine> {
    config: E::Config,
    ring: usize,
    matrix: Option<E::Matrix>,
    p: Option<E::Vector>,
    b: Option<E::Vector>,
    krylov: Option<E::Solver>,
}

/// Structural record of the uploaded operator, frozen at `set_operator`
/// and checked against every `update_operator`.
struct OperatorShape {
    n_local_rows: usize,
    n_global_rows: u64,
    n_local_nz: usize,
    /// Per-member row counts of this device world, in device-rank order.
    /// Proxy only; this is the gather/scatter partition for solves.
    member_rows: Option<Vec<usize>>,
    member_nnz: Option<Vec<usize>>,
}

struct Instance<E: Engine, C: Communicator> {
    comms: CommunicatorSet<C>,
    topology: ProcessTopology,
    mode: Mode,
    gpu: Option<GpuSide<E>>,
    shape: Option<OperatorShape>,
    last_iterations: Option<usize>,
}

/// A distributed solver instance funnelling many ranks onto one device.
///
/// ```
/// use std::rc::Rc;
/// use funnel::comm::local::LocalCluster;
/// use funnel::context::ResourcePool;
/// use funnel::engine::reference::ReferenceEngine;
/// use funnel::consolidate::CsrSlice;
/// use funnel::solver::Solver;
///
/// let comm = LocalCluster::new(1).pop().unwrap();
/// let pool = Rc::new(ResourcePool::new());
/// let mut solver = Solver::new(ReferenceEngine::new(), pool);
/// solver.initialize(&comm, "dDDI", "").unwrap();
///
/// // 2x2 diagonal system: 2 p = b.
/// let matrix = CsrSlice {
///     row_offsets: &[0, 1, 2],
///     col_indices: &[0, 1],
///     values: &[2.0, 2.0],
/// };
/// solver.set_operator(2, 2, 2, &matrix).unwrap();
///
/// let mut p = vec![0.0, 0.0];
/// solver.solve(&mut p, &[2.0, 4.0]).unwrap();
/// assert_eq!(p, vec![1.0, 2.0]);
/// assert!(solver.iterations().unwrap() > 0);
/// solver.finalize().unwrap();
/// ```
pub struct Solver<E: Engine, C: Communicator> {
    engine: E,
    pool: Rc<ResourcePool<E>>,
    instance: Option<Instance<E, C>>,
    finalized: bool,
}

impl<E: Engine, C: Communicator> Solver<E, C> {
    /// A fresh, uninitialized instance sharing the process-wide pool.
    pub fn new(engine: E, pool: Rc<ResourcePool<E>>) -> Self {
        Self {
            engine,
            pool,
            instance: None,
            finalized: false,
        }
    }

    /// This process's place in the topology, once initialized.
    pub fn topology(&self) -> Option<&ProcessTopology> {
        self.instance.as_ref().map(|inst| &inst.topology)
    }

    /// Build the communicator hierarchy, elect the proxies, and register
    /// with the shared resource pool. `mode` must be one of the fixed
    /// mode strings; `config` is handed to the engine untouched.
    ///
    /// Collective over `comm`.
    pub fn initialize(&mut self, comm: &C, mode: &str, config: &str) -> Result<()> {
        if self.finalized {
            return Err(FunnelError::Usage(
                "instance was finalized and cannot be reused".into(),
            ));
        }
        if self.instance.is_some() {
            return Err(FunnelError::Usage("instance already initialized".into()));
        }
        let mode: Mode = mode.parse()?;

        let device_count = self.engine.device_count()?;
        let (comms, topo) = topology::build(comm, device_count)?;

        let gpu = if let Role::Proxy { device } = topo.role {
            let config = self.engine.create_config(config)?;
            if let Err(e) = self.pool.acquire(&self.engine, Some((&config, device))) {
                // Original error wins; the config teardown is best-effort.
                let _ = self.engine.destroy_config(config);
                return Err(e);
            }
            let ring = match self.engine.ring_width(&config) {
                Ok(ring) => ring,
                Err(e) => {
                    let _ = self.pool.release(&self.engine);
                    let _ = self.engine.destroy_config(config);
                    return Err(e);
                }
            };
            Some(GpuSide {
                config,
                ring,
                matrix: None,
                p: None,
                b: None,
                krylov: None,
            })
        } else {
            self.pool.acquire(&self.engine, None)?;
            None
        };

        tracing::info!(
            global_rank = topo.global_rank,
            device_world = topo.device_size,
            proxy = topo.role.is_proxy(),
            %mode,
            "solver instance initialized"
        );

        self.instance = Some(Instance {
            comms,
            topology: topo,
            mode,
            gpu,
            shape: None,
            last_iterations: None,
        });
        Ok(())
    }

    /// Consolidate and upload the distributed operator.
    ///
    /// Every device-world member contributes its CSR fragment; the proxy
    /// merges them into one contiguous local block (offsets renumbered,
    /// column indices kept global) and uploads it once, together with
    /// the halo ring width. May only be called once per instance;
    /// structural changes require a fresh instance, value changes go
    /// through `update_operator`.
    ///
    /// Collective over the instance's communicators.
    pub fn set_operator(
        &mut self,
        n_local_rows: usize,
        n_global_rows: u64,
        n_local_nz: usize,
        matrix: &CsrSlice<'_>,
    ) -> Result<()> {
        let engine = &self.engine;
        let pool = &self.pool;
        let inst = self
            .instance
            .as_mut()
            .ok_or_else(|| FunnelError::Usage("set_operator before initialize".into()))?;
        if inst.shape.is_some() {
            return Err(FunnelError::Usage(
                "operator already set; use update_operator for new values".into(),
            ));
        }
        matrix.check(n_local_rows, n_local_nz)?;

        let _span = tracing::debug_span!("set_operator", n_local_rows, n_local_nz).entered();

        // Establish each rank's contiguous global row range.
        let all_rows = inst.comms.global.allgather_u64(n_local_rows as u64)?;
        let total: u64 = all_rows.iter().sum();
        if total != n_global_rows {
            return Err(FunnelError::Usage(format!(
                "local row counts sum to {total}, caller declared {n_global_rows} global rows"
            )));
        }
        let my_start = consolidate::row_starts(&all_rows)[inst.topology.global_rank];

        // Funnel structure and values to the proxy at device-world rank 0.
        let dev = &inst.comms.device;
        let member_rows = dev.gather_counts(n_local_rows, 0)?;
        let member_nnz = dev.gather_counts(n_local_nz, 0)?;
        let lengths = dev.gatherv_u64(&matrix.row_lengths(), member_rows.as_deref(), 0)?;
        let span_counts = vec![2usize; dev.size()];
        let spans = dev.gatherv_u64(
            &[my_start, n_local_rows as u64],
            member_rows.as_ref().map(|_| span_counts.as_slice()),
            0,
        )?;
        let cols = dev.gatherv_u64(matrix.col_indices, member_nnz.as_deref(), 0)?;
        let values = dev.gatherv_f64(matrix.values, member_nnz.as_deref(), 0)?;

        if inst.topology.role.is_proxy() {
            let mode = inst.mode;
            let gpu = inst.gpu.as_mut().expect("proxy holds engine handles");
            let lengths = lengths.expect("proxy gathered row lengths");
            let offsets = consolidate::merge_offsets(&lengths);
            let layout =
                consolidate::merge_layout(n_global_rows, &spans.expect("proxy gathered spans"))?;
            let cols = cols.expect("proxy gathered columns");
            let values = values.expect("proxy gathered values");
            debug_assert_eq!(layout.local_rows() + 1, offsets.len());

            let mut matrix_handle = pool.with_resource(|r| engine.create_matrix(r, mode))?;
            engine.upload_matrix(&mut matrix_handle, &layout, &offsets, &cols, &values, gpu.ring)?;

            let p = pool.with_resource(|r| engine.create_vector(r, mode))?;
            let b = pool.with_resource(|r| engine.create_vector(r, mode))?;
            let config = &gpu.config;
            let mut krylov = pool.with_resource(|r| engine.create_solver(r, mode, config))?;
            engine.bind(&mut krylov, &matrix_handle)?;

            tracing::debug!(
                consolidated_rows = layout.local_rows(),
                members = layout.blocks.len(),
                "operator uploaded"
            );

            gpu.matrix = Some(matrix_handle);
            gpu.p = Some(p);
            gpu.b = Some(b);
            gpu.krylov = Some(krylov);
        }

        inst.shape = Some(OperatorShape {
            n_local_rows,
            n_global_rows,
            n_local_nz,
            member_rows,
            member_nnz,
        });
        Ok(())
    }

    /// Replace the operator's coefficient values, structure unchanged,
    /// and refresh the engine's numeric setup. The declared counts must
    /// match the last `set_operator` exactly.
    ///
    /// Collective over the instance's communicators.
    pub fn update_operator(
        &mut self,
        n_local_rows: usize,
        n_local_nz: usize,
        matrix: &CsrSlice<'_>,
    ) -> Result<()> {
        let engine = &self.engine;
        let inst = self
            .instance
            .as_mut()
            .ok_or_else(|| FunnelError::Usage("update_operator before initialize".into()))?;
        let shape = inst
            .shape
            .as_ref()
            .ok_or_else(|| FunnelError::Usage("update_operator before set_operator".into()))?;
        if n_local_rows != shape.n_local_rows || n_local_nz != shape.n_local_nz {
            return Err(FunnelError::Usage(format!(
                "structural mismatch: operator was set with {} rows / {} nonzeros, \
                 update declares {n_local_rows} / {n_local_nz}",
                shape.n_local_rows, shape.n_local_nz
            )));
        }
        matrix.check(n_local_rows, n_local_nz)?;

        let _span = tracing::debug_span!("update_operator", n_local_nz).entered();

        let values =
            inst.comms
                .device
                .gatherv_f64(matrix.values, shape.member_nnz.as_deref(), 0)?;

        if inst.topology.role.is_proxy() {
            let gpu = inst.gpu.as_mut().expect("proxy holds engine handles");
            let matrix_handle = gpu.matrix.as_mut().expect("proxy holds a matrix handle");
            engine.replace_values(matrix_handle, &values.expect("proxy gathered values"))?;
            let krylov = gpu.krylov.as_mut().expect("proxy holds a solver handle");
            engine.rebind(krylov, matrix_handle)?;
        }
        Ok(())
    }

    /// Solve the system. `p` carries the initial guess in and the
    /// solution out on every rank; `b` is the untouched right-hand side.
    ///
    /// The device world gathers both vectors into the proxy in the same
    /// rank order the operator was consolidated in, the proxy runs the
    /// engine's blocking solve, and the solution is scattered back, so
    /// no rank observes a partially updated `p`. Collective over the
    /// device world; all members must call `solve` in lockstep.
    pub fn solve(&mut self, p: &mut [f64], b: &[f64]) -> Result<()> {
        let engine = &self.engine;
        let inst = self
            .instance
            .as_mut()
            .ok_or_else(|| FunnelError::Usage("solve before initialize".into()))?;
        let shape = inst
            .shape
            .as_ref()
            .ok_or_else(|| FunnelError::Usage("solve before set_operator".into()))?;
        if p.len() != shape.n_local_rows || b.len() != shape.n_local_rows {
            return Err(FunnelError::Usage(format!(
                "vector length {} / {} does not match the operator's {} local rows",
                p.len(),
                b.len(),
                shape.n_local_rows
            )));
        }

        let _span = tracing::debug_span!(
            "solve",
            rows = shape.n_local_rows,
            proxy = inst.topology.role.is_proxy()
        )
        .entered();

        let dev = &inst.comms.device;
        let counts = shape.member_rows.as_deref();
        let gathered_p = dev.gatherv_f64(p, counts, 0)?;
        let gathered_b = dev.gatherv_f64(b, counts, 0)?;

        let mut solution = gathered_p;
        let iterations = if inst.topology.role.is_proxy() {
            let gpu = inst.gpu.as_mut().expect("proxy holds engine handles");
            let solution = solution.as_mut().expect("proxy gathered the guess");
            let rhs = gathered_b.expect("proxy gathered the right-hand side");

            let p_handle = gpu.p.as_mut().expect("vectors created in set_operator");
            let b_handle = gpu.b.as_mut().expect("vectors created in set_operator");
            engine.upload_vector(p_handle, solution)?;
            engine.upload_vector(b_handle, &rhs)?;

            let krylov = gpu.krylov.as_mut().expect("proxy holds a solver handle");
            engine.solve(krylov, p_handle, b_handle)?;
            engine.download_vector(p_handle, solution)?;
            engine.iterations(&*krylov)? as u64
        } else {
            0
        };

        // Every rank learns the iteration count; the residual history
        // stays with the proxy's engine handle.
        let iterations = dev.broadcast_u64(iterations, 0)? as usize;
        dev.scatterv_f64(
            solution.as_ref().map(|s| (s.as_slice(), counts.expect("proxy holds counts"))),
            p,
            0,
        )?;

        inst.last_iterations = Some(iterations);
        tracing::debug!(iterations, "solve completed");
        Ok(())
    }

    /// Iteration count of the last solve, available on every rank of the
    /// device world.
    pub fn iterations(&self) -> Result<usize> {
        self.instance
            .as_ref()
            .and_then(|inst| inst.last_iterations)
            .ok_or_else(|| FunnelError::Usage("no solve has completed".into()))
    }

    /// Residual recorded at `iteration` during the last solve. Index 0
    /// is the initial residual and `iterations()` the final one, making
    /// `residual(iterations()?)` the converged residual. The history
    /// lives in the proxy's engine handle; relays cannot query it.
    pub fn residual(&self, iteration: usize) -> Result<f64> {
        let inst = self
            .instance
            .as_ref()
            .ok_or_else(|| FunnelError::Usage("residual before initialize".into()))?;
        let iterations = inst
            .last_iterations
            .ok_or_else(|| FunnelError::Usage("no solve has completed".into()))?;
        if iteration > iterations {
            return Err(FunnelError::Usage(format!(
                "residual requested for iteration {iteration}, last solve ran {iterations}"
            )));
        }
        let gpu = inst.gpu.as_ref().ok_or_else(|| {
            FunnelError::Usage("residual history lives on the device-owning proxy".into())
        })?;
        let krylov = gpu.krylov.as_ref().expect("solve implies a solver handle");
        self.engine.residual(krylov, iteration)
    }

    /// Tear the instance down: engine handles in reverse creation order,
    /// then the pool registration (the last instance out destroys the
    /// shared resource), then the communicators, innermost first.
    /// Calling `finalize` again is a no-op.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let Some(inst) = self.instance.take() else {
            return Ok(());
        };

        // Teardown runs to completion even if a step fails: the pool
        // registration must be released and the communicators dropped
        // regardless, or the shared resource leaks for good. The first
        // error is reported once everything has been attempted.
        let mut first_err = None;
        let mut note = |result: Result<()>| {
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        };
        if let Some(gpu) = inst.gpu {
            if let Some(krylov) = gpu.krylov {
                note(self.engine.destroy_solver(krylov));
            }
            if let Some(p) = gpu.p {
                note(self.engine.destroy_vector(p));
            }
            if let Some(b) = gpu.b {
                note(self.engine.destroy_vector(b));
            }
            if let Some(matrix) = gpu.matrix {
                note(self.engine.destroy_matrix(matrix));
            }
            note(self.engine.destroy_config(gpu.config));
        }
        note(self.pool.release(&self.engine));
        // `inst.comms` drops here, innermost communicator first.
        tracing::debug!("solver instance finalized");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<E: Engine, C: Communicator> Drop for Solver<E, C> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::warn!(error = %e, "finalize during drop failed");
        }
    }
}
