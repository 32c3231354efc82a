//! Tensor descriptors and graph-owned tensors.

use std::collections::BTreeSet;
use std::fmt;

use crate::graph::handle::TensorHandle;
use crate::graph::types::{
    Coordinates, DataType, EdgeId, QuantizationInfo, Target, TensorId, TensorShape,
};

/// Value-type tensor metadata.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TensorDescriptor {
    pub shape: TensorShape,
    pub data_type: DataType,
    pub quant_info: QuantizationInfo,
    pub target: Target,
}

impl TensorDescriptor {
    pub fn new(shape: impl Into<TensorShape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            quant_info: QuantizationInfo::default(),
            target: Target::Unspecified,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_quant_info(mut self, quant_info: QuantizationInfo) -> Self {
        self.quant_info = quant_info;
        self
    }

    /// Bytes needed to hold the tensor
    pub fn total_bytes(&self) -> usize {
        self.shape.total_size().saturating_mul(self.data_type.size())
    }
}

/// Fills or consumes host data of a tensor around a workload run.
///
/// Returning `false` signals that the accessor has no more data.
pub trait TensorAccessor {
    fn access_tensor(&mut self, data: &mut [f32]) -> bool;
}

impl<F> TensorAccessor for F
where
    F: FnMut(&mut [f32]) -> bool,
{
    fn access_tensor(&mut self, data: &mut [f32]) -> bool {
        self(data)
    }
}

/// Marks a tensor as a view into another tensor's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTensorInfo {
    pub parent: TensorId,
    pub coords: Coordinates,
    pub extend_parent: bool,
}

/// Graph-owned tensor node.
pub struct Tensor {
    id: TensorId,
    desc: TensorDescriptor,
    handle: Option<TensorHandle>,
    accessor: Option<Box<dyn TensorAccessor>>,
    bound_edges: BTreeSet<EdgeId>,
    subtensor: Option<SubTensorInfo>,
}

impl Tensor {
    pub fn new(id: TensorId, desc: TensorDescriptor) -> Self {
        Self {
            id,
            desc,
            handle: None,
            accessor: None,
            bound_edges: BTreeSet::new(),
            subtensor: None,
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn desc(&self) -> &TensorDescriptor {
        &self.desc
    }

    pub fn desc_mut(&mut self) -> &mut TensorDescriptor {
        &mut self.desc
    }

    pub fn handle(&self) -> Option<&TensorHandle> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut TensorHandle> {
        self.handle.as_mut()
    }

    pub fn set_handle(&mut self, handle: TensorHandle) {
        self.handle = Some(handle);
    }

    pub fn take_handle(&mut self) -> Option<TensorHandle> {
        self.handle.take()
    }

    pub fn set_accessor(&mut self, accessor: Box<dyn TensorAccessor>) {
        self.accessor = Some(accessor);
    }

    pub fn has_accessor(&self) -> bool {
        self.accessor.is_some()
    }

    pub(crate) fn take_accessor(&mut self) -> Option<Box<dyn TensorAccessor>> {
        self.accessor.take()
    }

    pub(crate) fn restore_accessor(&mut self, accessor: Box<dyn TensorAccessor>) {
        self.accessor = Some(accessor);
    }

    pub fn bound_edges(&self) -> &BTreeSet<EdgeId> {
        &self.bound_edges
    }

    pub(crate) fn bind_edge(&mut self, edge: EdgeId) {
        self.bound_edges.insert(edge);
    }

    pub(crate) fn unbind_edge(&mut self, edge: EdgeId) {
        self.bound_edges.remove(&edge);
    }

    pub fn subtensor(&self) -> Option<&SubTensorInfo> {
        self.subtensor.as_ref()
    }

    pub fn set_subtensor(&mut self, info: Option<SubTensorInfo>) {
        self.subtensor = info;
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .field("handle", &self.handle)
            .field("has_accessor", &self.accessor.is_some())
            .field("bound_edges", &self.bound_edges)
            .field("subtensor", &self.subtensor)
            .finish()
    }
}
