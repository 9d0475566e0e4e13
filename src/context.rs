//! Process-wide shared accelerator resource, refcounted across solver
//! instances.
//!
//! The wrapped engine tolerates only one live resource context per
//! process, so all solver instances share one. This is an explicit
//! registry the application creates and hands to each instance (by `Rc`)
//! rather than a language-level static: ownership and teardown order
//! stay visible and the whole protocol is testable in isolation. No
//! atomics are involved; the count mutates only inside initialize and
//! finalize paths, which are single-threaded per process.

use std::cell::RefCell;

use crate::engine::Engine;
use crate::error::{FunnelError, Result};

struct PoolState<E: Engine> {
    live: usize,
    library_up: bool,
    resource: Option<E::Resource>,
}

/// Refcounted home of the shared accelerator resource.
///
/// State machine: Uninitialized -> Active(live) -> Destroyed. The first
/// device-owning acquire brings the library up and creates the resource;
/// the release that drops the count to zero destroys the resource and
/// shuts the library down. Relay processes participate in the count but
/// never touch the engine.
pub struct ResourcePool<E: Engine> {
    state: RefCell<PoolState<E>>,
}

impl<E: Engine> ResourcePool<E> {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(PoolState {
                live: 0,
                library_up: false,
                resource: None,
            }),
        }
    }

    /// Number of live solver instances registered with this pool.
    pub fn live(&self) -> usize {
        self.state.borrow().live
    }

    /// Register one solver instance. Device-owning processes pass their
    /// configuration and device id; the first of them initializes the
    /// library and creates the shared resource. Relays pass `None` and
    /// only join the count.
    pub fn acquire(&self, engine: &E, device: Option<(&E::Config, usize)>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.live == 0 {
            if let Some((config, device)) = device {
                engine.initialize_library()?;
                state.library_up = true;
                match engine.create_resources(config, device) {
                    Ok(resource) => state.resource = Some(resource),
                    Err(e) => {
                        // Unwind the half-initialized library before
                        // reporting; the original error wins.
                        if engine.shutdown_library().is_ok() {
                            state.library_up = false;
                        }
                        return Err(e);
                    }
                }
                tracing::debug!("shared accelerator resource created");
            }
        }
        state.live += 1;
        Ok(())
    }

    /// Deregister one solver instance; the last one out destroys the
    /// shared resource and shuts the library down.
    pub fn release(&self, engine: &E) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.live == 0 {
            return Err(FunnelError::Usage(
                "resource pool released more often than acquired".into(),
            ));
        }
        state.live -= 1;
        if state.live == 0 {
            if let Some(resource) = state.resource.take() {
                engine.destroy_resources(resource)?;
            }
            if state.library_up {
                engine.shutdown_library()?;
                state.library_up = false;
            }
            tracing::debug!("shared accelerator resource destroyed");
        }
        Ok(())
    }

    /// Run `f` with the shared resource. Fails on processes that hold no
    /// resource (relays, or before the first owning acquire).
    pub fn with_resource<T>(&self, f: impl FnOnce(&E::Resource) -> Result<T>) -> Result<T> {
        let state = self.state.borrow();
        let resource = state.resource.as_ref().ok_or_else(|| {
            FunnelError::Usage("no shared accelerator resource held by this process".into())
        })?;
        f(resource)
    }
}

impl<E: Engine> Default for ResourcePool<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::ReferenceEngine;
    use crate::engine::Engine;

    #[test]
    fn first_owning_acquire_creates_last_release_destroys() {
        let engine = ReferenceEngine::new();
        let cfg = engine.create_config("").unwrap();
        let pool = ResourcePool::new();

        for _ in 0..3 {
            pool.acquire(&engine, Some((&cfg, 0))).unwrap();
        }
        assert_eq!(pool.live(), 3);
        assert_eq!(engine.stats().resources_created, 1);
        assert_eq!(engine.stats().library_inits, 1);

        pool.release(&engine).unwrap();
        pool.release(&engine).unwrap();
        assert_eq!(engine.stats().resources_destroyed, 0);
        pool.release(&engine).unwrap();
        assert_eq!(engine.stats().resources_destroyed, 1);
        assert_eq!(engine.stats().library_shutdowns, 1);
    }

    #[test]
    fn relay_acquires_never_touch_the_engine() {
        let engine = ReferenceEngine::new();
        let pool: ResourcePool<ReferenceEngine> = ResourcePool::new();

        pool.acquire(&engine, None).unwrap();
        pool.acquire(&engine, None).unwrap();
        assert_eq!(pool.live(), 2);
        assert_eq!(engine.stats().library_inits, 0);

        pool.release(&engine).unwrap();
        pool.release(&engine).unwrap();
        assert_eq!(engine.stats().library_shutdowns, 0);
        assert!(pool
            .with_resource(|_| Ok(()))
            .is_err());
    }

    #[test]
    fn over_release_is_a_usage_fault() {
        let engine = ReferenceEngine::new();
        let pool: ResourcePool<ReferenceEngine> = ResourcePool::new();
        assert!(matches!(
            pool.release(&engine),
            Err(FunnelError::Usage(_))
        ));
    }

    #[test]
    fn resource_is_reachable_while_active() {
        let engine = ReferenceEngine::with_devices(2);
        let cfg = engine.create_config("").unwrap();
        let pool = ResourcePool::new();
        pool.acquire(&engine, Some((&cfg, 1))).unwrap();
        let device = pool.with_resource(|r| Ok(r.device)).unwrap();
        assert_eq!(device, 1);
        pool.release(&engine).unwrap();
    }

    #[test]
    fn failed_resource_creation_unwinds_the_library() {
        let engine = ReferenceEngine::with_devices(1);
        let cfg = engine.create_config("").unwrap();
        let pool = ResourcePool::new();

        // Device 5 does not exist; creation fails after library init.
        assert!(pool.acquire(&engine, Some((&cfg, 5))).is_err());
        assert_eq!(pool.live(), 0);
        assert_eq!(engine.stats().library_inits, 1);
        assert_eq!(engine.stats().library_shutdowns, 1);

        // The pool is reusable afterwards.
        pool.acquire(&engine, Some((&cfg, 0))).unwrap();
        pool.release(&engine).unwrap();
    }
}
