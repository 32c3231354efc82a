//! Graph front end: data model, passes, lowering and execution.
//!
//! The usual flow is
//! 1. build a [`Graph`] with [`GraphBuilder`]
//! 2. hand it to a [`GraphManager`] together with a [`GraphContext`],
//!    a [`BackendRegistry`](crate::backends::BackendRegistry) and a [`PassManager`]
//! 3. call `execute_graph` as often as needed

pub mod builder;
pub mod config;
pub mod context;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod handle;
pub mod manager;
pub mod mutators;
pub mod node;
pub mod pass_manager;
pub mod tensor;
pub mod types;
pub mod utils;
pub mod workload;

pub use builder::{GraphBuilder, LayerAccessors, NodeIdxPair, NodeParams};
pub use config::GraphConfig;
pub use context::{GraphContext, MemoryManagerContext};
pub use graph::{Edge, Graph};
pub use handle::{Backing, HandleState, TensorHandle};
pub use manager::GraphManager;
pub use mutators::{
    ActivationFusionMutator, DeadCodeEliminationMutator, DepthConcatSubTensorMutator,
    InPlaceOperationMutator, TargetAssignmentMutator,
};
pub use node::{Node, NodeKind};
pub use pass_manager::{GraphMutator, PassManager, PassStats};
pub use tensor::{SubTensorInfo, Tensor, TensorAccessor, TensorDescriptor};
pub use types::*;
pub use utils::{
    create_default_pass_manager, force_target_to_graph, get_default_target, is_target_supported,
    setup_default_graph_context,
};
pub use workload::{ExecutionContext, ExecutionTask, ExecutionWorkload, WorkloadBuilder};
