//! Common test utilities for graph execution tests
//!
//! Backend registries are not `Sync`, so every test builds its own through
//! [`cpu_registry`] or [`host_gpu_registry`]. Only plain data is shared
//! through `Lazy` statics.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::{build_conv_net, cpu_registry, new_capture};
//!
//! let sink = new_capture();
//! let (mut graph, _) = build_conv_net("net", &sink)?;
//! ```

#![allow(dead_code)]

mod fixtures;
mod tempfile_helpers;

pub use fixtures::*;
pub use serial_test::serial;
pub use tempfile_helpers::*;

use std::sync::Arc;

use once_cell::sync::Lazy;

use graphforge::graph::MemoryManagerAffinity;
use graphforge::{
    create_default_pass_manager, BackendRegistry, Graph, GraphConfig, GraphContext, GraphManager,
    GraphResult, HostAllocator, Target,
};

/// Configurations every memory-planning property is checked under
pub static PLANNING_CONFIGS: Lazy<Vec<GraphConfig>> = Lazy::new(|| {
    vec![
        GraphConfig::default()
            .with_memory_manager(true)
            .with_memory_affinity(MemoryManagerAffinity::Buffer),
        GraphConfig::default()
            .with_memory_manager(true)
            .with_memory_affinity(MemoryManagerAffinity::Offset),
        GraphConfig::default()
            .with_memory_manager(true)
            .with_memory_affinity(MemoryManagerAffinity::Buffer)
            .with_num_memory_pools(3),
        GraphConfig::default()
            .with_memory_manager(true)
            .with_memory_affinity(MemoryManagerAffinity::Offset)
            .with_num_memory_pools(2)
            .with_tensor_alignment(256),
    ]
});

pub fn no_reuse_config() -> GraphConfig {
    GraphConfig::default().with_memory_manager(false)
}

pub fn cpu_registry() -> BackendRegistry {
    BackendRegistry::with_default_backends()
}

/// CPU plus both GPU targets, the GPU ones backed by host memory.
pub fn host_gpu_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::with_default_backends();
    registry.register_gpu_compute(Arc::new(HostAllocator::named("gpu-compute")));
    registry.register_gpu_shader(Arc::new(HostAllocator::named("gpu-shader")));
    registry
}

/// Finalize `graph` for `target` with the default passes and run it `runs`
/// times, returning the context so callers can inspect memory managers.
pub fn finalize_and_run(
    graph: &mut Graph,
    registry: &BackendRegistry,
    config: GraphConfig,
    target: Target,
    runs: usize,
) -> GraphResult<(GraphManager, GraphContext)> {
    let mut ctx = GraphContext::new(config);
    let mut manager = GraphManager::new();
    let pm = create_default_pass_manager(target);
    manager.finalize_graph(graph, &mut ctx, registry, &pm, target)?;
    for _ in 0..runs {
        manager.execute_graph(graph, &mut ctx)?;
    }
    Ok((manager, ctx))
}

/// Bitwise equality, so `-0.0` and `0.0` differ and NaN equals itself.
pub fn assert_bit_identical(expected: &[f32], actual: &[f32]) {
    assert_eq!(expected.len(), actual.len(), "length mismatch");
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        assert_eq!(
            e.to_bits(),
            a.to_bits(),
            "element {} differs: {} vs {}",
            i,
            e,
            a
        );
    }
}

pub fn assert_close(expected: &[f32], actual: &[f32], tolerance: f32) {
    assert_eq!(expected.len(), actual.len(), "length mismatch");
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        assert!(
            (e - a).abs() <= tolerance,
            "element {} differs: expected {}, got {}",
            i,
            e,
            a
        );
    }
}
