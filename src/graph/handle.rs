//! Backend-specific tensor storage handles.
//!
//! A handle is created by the backend matching the tensor's target. Storage is
//! one of:
//! - dedicated: a buffer owned by the handle, resident for the whole run
//! - managed: a region planned by the target's memory manager, resident only
//!   between its commit and release steps
//! - view: an element range inside another tensor's storage

use std::fmt;

use crate::error::{GraphError, GraphResult, Status};
use crate::graph::types::{Coordinates, DataType, Target, TensorId, TensorShape};
use crate::memory::allocator::{Allocator, Buffer};
use crate::memory::lifetime::AllocationId;

/// Residency of a handle's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created, storage not yet bound
    Configured,
    /// Storage holds valid data
    Resident,
    /// Storage returned to the memory manager; contents undefined
    Released,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleState::Configured => write!(f, "configured"),
            HandleState::Resident => write!(f, "resident"),
            HandleState::Released => write!(f, "released"),
        }
    }
}

/// Window into a parent tensor's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTensorView {
    pub parent: TensorId,
    pub coords: Coordinates,
    /// Element offset from the start of the parent
    pub offset_elems: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backing {
    Unallocated,
    Dedicated(Buffer),
    Managed(AllocationId),
    View(SubTensorView),
}

/// Storage handle of one tensor on one target.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorHandle {
    target: Target,
    shape: TensorShape,
    data_type: DataType,
    backing: Backing,
    state: HandleState,
    mapped: bool,
}

impl TensorHandle {
    pub fn new(target: Target, shape: TensorShape, data_type: DataType) -> Self {
        Self {
            target,
            shape,
            data_type,
            backing: Backing::Unallocated,
            state: HandleState::Configured,
            // Host memory is always addressable
            mapped: !target.is_gpu(),
        }
    }

    pub fn new_view(
        target: Target,
        shape: TensorShape,
        data_type: DataType,
        view: SubTensorView,
    ) -> Self {
        Self {
            backing: Backing::View(view),
            ..Self::new(target, shape, data_type)
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn num_elements(&self) -> usize {
        self.shape.total_size()
    }

    pub fn extent_bytes(&self) -> usize {
        self.num_elements().saturating_mul(self.data_type.size())
    }

    pub fn is_subtensor(&self) -> bool {
        matches!(self.backing, Backing::View(_))
    }

    pub fn view(&self) -> Option<&SubTensorView> {
        match &self.backing {
            Backing::View(view) => Some(view),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<TensorId> {
        self.view().map(|v| v.parent)
    }

    pub fn allocation(&self) -> Option<AllocationId> {
        match self.backing {
            Backing::Managed(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.state == HandleState::Resident
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Give the handle its own buffer. Dedicated storage stays resident.
    pub fn allocate_dedicated(&mut self, allocator: &dyn Allocator, alignment: usize) -> Status {
        match self.backing {
            Backing::Unallocated => {
                let buffer = allocator.allocate(self.extent_bytes(), alignment)?;
                self.backing = Backing::Dedicated(buffer);
                self.state = HandleState::Resident;
                Ok(())
            }
            Backing::Dedicated(_) => Ok(()),
            _ => Err(GraphError::InvalidHandle(format!(
                "cannot allocate dedicated storage for {:?} handle",
                self.backing_kind()
            ))),
        }
    }

    /// Bind the handle to a planned region of the memory manager.
    pub fn bind_managed(&mut self, allocation: AllocationId) -> Status {
        match self.backing {
            Backing::Unallocated => {
                self.backing = Backing::Managed(allocation);
                Ok(())
            }
            Backing::Managed(existing) if existing == allocation => Ok(()),
            _ => Err(GraphError::InvalidHandle(format!(
                "cannot bind {} to {:?} handle",
                allocation,
                self.backing_kind()
            ))),
        }
    }

    /// Mark storage resident before the first task that touches it.
    pub fn commit(&mut self) -> Status {
        match self.backing {
            Backing::Unallocated => Err(GraphError::InvalidHandle(
                "commit on handle without storage".to_string(),
            )),
            _ => {
                self.state = HandleState::Resident;
                Ok(())
            }
        }
    }

    /// Mark storage released after its last use.
    ///
    /// Managed regions keep their bytes; the next group member overwrites them.
    pub fn release(&mut self) {
        if self.state == HandleState::Resident {
            self.state = HandleState::Released;
        }
    }

    pub fn map(&mut self) {
        self.mapped = true;
    }

    pub fn unmap(&mut self) {
        if self.target.is_gpu() {
            self.mapped = false;
        }
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.backing {
            Backing::Dedicated(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn buffer_mut(&mut self) -> Option<&mut Buffer> {
        match &mut self.backing {
            Backing::Dedicated(buffer) => Some(buffer),
            _ => None,
        }
    }

    fn backing_kind(&self) -> &'static str {
        match self.backing {
            Backing::Unallocated => "unallocated",
            Backing::Dedicated(_) => "dedicated",
            Backing::Managed(_) => "managed",
            Backing::View(_) => "view",
        }
    }
}

/// Element offset of a sub-tensor if it is one contiguous range of its parent.
///
/// Every dimension below the outermost non-unit view dimension has to cover
/// the parent completely, starting at 0.
pub fn contiguous_offset(
    parent: &TensorShape,
    shape: &TensorShape,
    coords: &Coordinates,
) -> Option<usize> {
    let rank = parent
        .num_dimensions()
        .max(shape.num_dimensions())
        .max(coords.0.len());
    let outer = (0..rank).rev().find(|&d| shape.dim(d) > 1).unwrap_or(0);

    for d in 0..outer {
        if shape.dim(d) != parent.dim(d) || coords.get(d) != 0 {
            return None;
        }
    }

    let strides = parent.strides(rank);
    Some(
        strides
            .iter()
            .enumerate()
            .map(|(d, stride)| coords.get(d) * stride)
            .sum(),
    )
}

/// Whether `shape` placed at `coords` stays inside `parent` in every dimension.
pub fn fits_inside(parent: &TensorShape, shape: &TensorShape, coords: &Coordinates) -> bool {
    let rank = parent
        .num_dimensions()
        .max(shape.num_dimensions())
        .max(coords.0.len());
    (0..rank).all(|d| coords.get(d) + shape.dim(d) <= parent.dim(d))
}

/// Resolve the full storage extent of a dedicated handle for host access.
pub(crate) fn check_host_access(handle: &TensorHandle, id: TensorId) -> GraphResult<()> {
    if !handle.is_mapped() {
        return Err(GraphError::InvalidHandle(format!(
            "tensor {} on {} must be mapped before host access",
            id, handle.target
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::HostAllocator;

    fn shape(dims: &[usize]) -> TensorShape {
        TensorShape::new(dims.to_vec())
    }

    #[test]
    fn test_cpu_handle_is_mapped() {
        let handle = TensorHandle::new(Target::Cpu, shape(&[4]), DataType::F32);
        assert!(handle.is_mapped());
        assert_eq!(handle.state(), HandleState::Configured);
        assert_eq!(handle.extent_bytes(), 16);
    }

    #[test]
    fn test_gpu_handle_needs_map() {
        let mut handle = TensorHandle::new(Target::GpuCompute, shape(&[4]), DataType::F32);
        assert!(!handle.is_mapped());
        handle.map();
        assert!(handle.is_mapped());
        handle.unmap();
        assert!(!handle.is_mapped());
    }

    #[test]
    fn test_dedicated_allocation_is_resident() {
        let alloc = HostAllocator::new();
        let mut handle = TensorHandle::new(Target::Cpu, shape(&[8, 2]), DataType::F32);
        handle.allocate_dedicated(&alloc, 64).unwrap();
        assert!(handle.is_resident());
        assert_eq!(handle.buffer().map(|b| b.len_bytes()), Some(64));
    }

    #[test]
    fn test_managed_commit_release_cycle() {
        let mut handle = TensorHandle::new(Target::Cpu, shape(&[4]), DataType::F32);
        assert!(handle.commit().is_err());
        handle.bind_managed(AllocationId(3)).unwrap();
        handle.commit().unwrap();
        assert!(handle.is_resident());
        handle.release();
        assert_eq!(handle.state(), HandleState::Released);
        handle.commit().unwrap();
        assert!(handle.is_resident());
    }

    #[test]
    fn test_view_cannot_take_dedicated_storage() {
        let view = SubTensorView {
            parent: TensorId(0),
            coords: Coordinates::default(),
            offset_elems: 0,
        };
        let mut handle = TensorHandle::new_view(Target::Cpu, shape(&[4]), DataType::F32, view);
        assert!(handle.is_subtensor());
        assert_eq!(handle.parent(), Some(TensorId(0)));
        assert!(handle
            .allocate_dedicated(&HostAllocator::new(), 64)
            .is_err());
    }

    #[test]
    fn test_contiguous_offset_channel_slice() {
        let parent = shape(&[4, 4, 6]);
        let view = shape(&[4, 4, 2]);
        assert_eq!(
            contiguous_offset(&parent, &view, &Coordinates::new(vec![0, 0, 3])),
            Some(48)
        );
    }

    #[test]
    fn test_contiguous_offset_rejects_strided_window() {
        let parent = shape(&[4, 4]);
        let view = shape(&[2, 2]);
        assert_eq!(
            contiguous_offset(&parent, &view, &Coordinates::new(vec![0, 0])),
            None
        );
        // A single row is contiguous
        assert_eq!(
            contiguous_offset(&parent, &shape(&[4]), &Coordinates::new(vec![0, 2])),
            Some(8)
        );
    }

    #[test]
    fn test_fits_inside() {
        let parent = shape(&[4, 4, 6]);
        assert!(fits_inside(&parent, &shape(&[4, 4, 2]), &Coordinates::new(vec![0, 0, 4])));
        assert!(!fits_inside(&parent, &shape(&[4, 4, 2]), &Coordinates::new(vec![0, 0, 5])));
    }
}
