//! GraphForge - compute-graph execution engine
//!
//! Lowers a declarative graph of tensor operations onto pluggable device
//! backends, plans tensor memory so that buffers are shared between tensors
//! that are never live at the same time, and runs the resulting workload.

#![allow(clippy::too_many_arguments)] // Builder helpers mirror layer parameters
#![allow(clippy::needless_range_loop)] // Clearer for kernel index math

pub mod backends;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod logging;
pub mod memory;

pub use backends::{BackendRegistry, CpuBackend, DeviceBackend, GpuComputeBackend, GpuShaderBackend, Operator};
pub use error::{ErrorCategory, GraphError, GraphResult, Status};
pub use graph::{
    create_default_pass_manager, ExecutionWorkload, Graph, GraphBuilder, GraphConfig, GraphContext,
    GraphManager, NodeIdxPair, NodeParams, PassManager, Target, TensorDescriptor, TensorShape,
};
pub use logging::init_logging_default;
pub use memory::{Allocator, HostAllocator, MemoryManagerOnDemand};
