//! Explicit backend registry.
//!
//! Factories are registered per target; the backend itself is created on the
//! first lookup and reused afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use once_cell::unsync::OnceCell;

use crate::backends::{CpuBackend, DeviceBackend, GpuComputeBackend, GpuShaderBackend};
use crate::error::{GraphError, GraphResult};
use crate::graph::types::Target;
use crate::memory::allocator::Allocator;

pub type BackendFactory = Box<dyn Fn() -> Box<dyn DeviceBackend>>;

struct Entry {
    factory: BackendFactory,
    instance: OnceCell<Box<dyn DeviceBackend>>,
}

pub struct BackendRegistry {
    entries: BTreeMap<Target, Entry>,
}

impl BackendRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with the CPU backend, the only one needing no device handle.
    pub fn with_default_backends() -> Self {
        let mut registry = Self::new();
        registry.register(Target::Cpu, || Box::new(CpuBackend::new()));
        registry
    }

    /// Register `factory` for `target`, replacing any earlier registration.
    ///
    /// Returns false for `Target::Unspecified`, which cannot own a backend.
    pub fn register<F>(&mut self, target: Target, factory: F) -> bool
    where
        F: Fn() -> Box<dyn DeviceBackend> + 'static,
    {
        if target == Target::Unspecified {
            tracing::warn!("Refusing to register a backend for an unspecified target");
            return false;
        }
        let replaced = self
            .entries
            .insert(
                target,
                Entry {
                    factory: Box::new(factory),
                    instance: OnceCell::new(),
                },
            )
            .is_some();
        tracing::debug!("Registered {} backend (replaced: {})", target, replaced);
        true
    }

    pub fn register_gpu_compute(&mut self, allocator: Arc<dyn Allocator>) -> bool {
        self.register(Target::GpuCompute, move || {
            Box::new(GpuComputeBackend::new(Arc::clone(&allocator)))
        })
    }

    pub fn register_gpu_shader(&mut self, allocator: Arc<dyn Allocator>) -> bool {
        self.register(Target::GpuShader, move || {
            Box::new(GpuShaderBackend::new(Arc::clone(&allocator)))
        })
    }

    pub fn contains(&self, target: Target) -> bool {
        self.entries.contains_key(&target)
    }

    /// Backend for `target`, instantiated on first use.
    pub fn find_backend(&self, target: Target) -> Option<&dyn DeviceBackend> {
        let entry = self.entries.get(&target)?;
        let backend = entry.instance.get_or_init(|| {
            tracing::debug!("Instantiating {} backend", target);
            (entry.factory)()
        });
        Some(backend.as_ref())
    }

    pub fn backend(&self, target: Target) -> GraphResult<&dyn DeviceBackend> {
        self.find_backend(target)
            .ok_or(GraphError::UnregisteredTarget(target))
    }

    pub fn registered_targets(&self) -> Vec<Target> {
        self.entries.keys().copied().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_default_backends()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instantiated: Vec<Target> = self
            .entries
            .iter()
            .filter(|(_, e)| e.instance.get().is_some())
            .map(|(t, _)| *t)
            .collect();
        f.debug_struct("BackendRegistry")
            .field("registered", &self.registered_targets())
            .field("instantiated", &instantiated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::HostAllocator;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_default_has_cpu_only() {
        let registry = BackendRegistry::default();
        assert_eq!(registry.registered_targets(), vec![Target::Cpu]);
        assert!(registry.find_backend(Target::GpuCompute).is_none());
        assert!(matches!(
            registry.backend(Target::GpuShader),
            Err(GraphError::UnregisteredTarget(Target::GpuShader))
        ));
    }

    #[test]
    fn test_backend_instantiated_once() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let mut registry = BackendRegistry::new();
        registry.register(Target::Cpu, move || {
            counter.set(counter.get() + 1);
            Box::new(CpuBackend::new())
        });

        assert_eq!(calls.get(), 0);
        assert_eq!(registry.backend(Target::Cpu).unwrap().target(), Target::Cpu);
        registry.backend(Target::Cpu).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_gpu_registration() {
        let mut registry = BackendRegistry::new();
        assert!(registry.register_gpu_compute(Arc::new(HostAllocator::named("gpu"))));
        assert!(registry.contains(Target::GpuCompute));
        assert_eq!(
            registry.backend(Target::GpuCompute).unwrap().target(),
            Target::GpuCompute
        );
    }

    #[test]
    fn test_unspecified_rejected() {
        let mut registry = BackendRegistry::new();
        assert!(!registry.register(Target::Unspecified, || Box::new(CpuBackend::new())));
        assert!(registry.registered_targets().is_empty());
    }
}
