//! Funnel routes the linear solves of a many-rank simulation onto a
//! handful of accelerators.
//!
//! A cluster typically runs far more MPI ranks than it has usable GPUs.
//! Funnel splits the world into per-device groups, elects one proxy
//! process per device, consolidates each group's CSR fragments into a
//! single contiguous block on the proxy, and runs the solve there while
//! the remaining ranks relay their rows and wait for their slice of the
//! solution. The caller keeps its natural row distribution; the device
//! sees one well-shaped system.
//!
//! The solve itself is delegated to an [`engine::Engine`], an exchangeable
//! backend holding the device library's handle lifecycle. The crate ships
//! [`engine::reference::ReferenceEngine`], a host-side BiCGSTAB backend
//! used throughout the test suite. Communication goes through the
//! [`comm::Communicator`] trait: [`comm::local::LocalCluster`] runs whole
//! topologies on threads in one process, and the `distributed` feature
//! adds an MPI transport.
//!
//! ```
//! use std::rc::Rc;
//! use funnel::comm::local::LocalCluster;
//! use funnel::consolidate::CsrSlice;
//! use funnel::context::ResourcePool;
//! use funnel::engine::reference::ReferenceEngine;
//! use funnel::solver::Solver;
//!
//! let comm = LocalCluster::new(1).pop().unwrap();
//! let mut solver = Solver::new(ReferenceEngine::new(), Rc::new(ResourcePool::new()));
//! solver.initialize(&comm, "dDDI", "").unwrap();
//!
//! // -u'' = f on three interior points, the usual tridiagonal stencil.
//! let matrix = CsrSlice {
//!     row_offsets: &[0, 2, 5, 7],
//!     col_indices: &[0, 1, 0, 1, 2, 1, 2],
//!     values: &[2.0, -1.0, -1.0, 2.0, -1.0, -1.0, 2.0],
//! };
//! solver.set_operator(3, 3, 7, &matrix).unwrap();
//!
//! let mut p = vec![0.0; 3];
//! solver.solve(&mut p, &[1.0, 0.0, 1.0]).unwrap();
//! assert!((p[0] - 1.0).abs() < 1e-8);
//! assert!((p[1] - 1.0).abs() < 1e-8);
//! assert!((p[2] - 1.0).abs() < 1e-8);
//! solver.finalize().unwrap();
//! ```

pub mod comm;
pub mod consolidate;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod solver;
pub mod topology;

pub use consolidate::CsrSlice;
pub use context::ResourcePool;
pub use engine::{Engine, Mode};
pub use error::{FunnelError, Result};
pub use solver::Solver;
pub use topology::{ProcessTopology, Role};
