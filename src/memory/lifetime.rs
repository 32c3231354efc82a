//! Lifetime managers: group allocations that are never live at the same time.
//!
//! Both strategies share the group assignment: allocations are visited in
//! `(start, id)` order and placed into the first group, in creation order,
//! whose members all ended before the allocation starts. Otherwise a new
//! group is opened. They differ in how groups map onto physical buffers:
//!
//! - **Blob**: one buffer per group, sized to its largest member.
//! - **Offset**: one buffer; each group occupies an aligned byte range in it.
//!   Offsets are recomputed from scratch whenever the membership changes.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{GraphError, Status};
use crate::graph::types::MemoryManagerAffinity;
use crate::memory::allocator::align_up;

/// Identifier of one managed allocation inside a memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub usize);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}

/// Half-open live interval `[start, end)` in workload steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lifetime {
    pub start: usize,
    pub end: usize,
}

impl Lifetime {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One allocation under lifetime tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedAllocation {
    pub id: AllocationId,
    pub size: usize,
    pub lifetime: Lifetime,
}

/// Allocations proven never simultaneously live, sharing one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifetimeGroup {
    pub members: Vec<AllocationId>,
    /// Largest member size in bytes
    pub size: usize,
    /// Index of the physical buffer holding the group
    pub buffer: usize,
    /// Byte offset of the group inside its buffer
    pub offset: usize,
}

/// Location of an allocation inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub buffer: usize,
    pub offset: usize,
    pub size: usize,
}

/// Frozen result of lifetime analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolLayout {
    pub affinity: MemoryManagerAffinity,
    pub buffer_sizes: Vec<usize>,
    pub groups: Vec<LifetimeGroup>,
    regions: BTreeMap<AllocationId, (usize, Region)>,
}

impl PoolLayout {
    pub fn region(&self, id: AllocationId) -> Option<Region> {
        self.regions.get(&id).map(|(_, region)| *region)
    }

    pub fn group_of(&self, id: AllocationId) -> Option<usize> {
        self.regions.get(&id).map(|(group, _)| *group)
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn num_allocations(&self) -> usize {
        self.regions.len()
    }

    /// Bytes of physical memory backing one pool
    pub fn total_bytes(&self) -> usize {
        self.buffer_sizes.iter().sum()
    }
}

/// Tracks live ranges of allocations and maps them onto buffers.
pub trait LifetimeManager: Send + fmt::Debug {
    fn affinity(&self) -> MemoryManagerAffinity;

    /// Record an allocation. The lifetime must not be empty.
    fn register(&mut self, allocation: ManagedAllocation) -> Status;

    fn allocations(&self) -> &[ManagedAllocation];

    /// Forget an allocation. Returns false if it was never registered.
    fn remove(&mut self, id: AllocationId) -> bool;

    fn clear(&mut self);

    /// Compute groups and their placement. `alignment` is a power of two.
    fn compute_layout(&self, alignment: usize) -> PoolLayout;
}

fn validate_registration(existing: &[ManagedAllocation], allocation: &ManagedAllocation) -> Status {
    if allocation.lifetime.start >= allocation.lifetime.end {
        return Err(GraphError::InternalError(format!(
            "{} has empty lifetime [{}, {})",
            allocation.id, allocation.lifetime.start, allocation.lifetime.end
        )));
    }
    if existing.iter().any(|a| a.id == allocation.id) {
        return Err(GraphError::InternalError(format!(
            "{} registered twice",
            allocation.id
        )));
    }
    Ok(())
}

/// First-fit group assignment shared by both strategies.
///
/// Returns `(members, max_size)` per group, groups in creation order.
fn assign_groups(allocations: &[ManagedAllocation]) -> Vec<(Vec<AllocationId>, usize)> {
    let mut order: Vec<&ManagedAllocation> = allocations.iter().collect();
    order.sort_by_key(|a| (a.lifetime.start, a.id));

    // (members, size, latest end among members)
    let mut groups: Vec<(Vec<AllocationId>, usize, usize)> = Vec::new();
    for allocation in order {
        // Visiting by start means a group is free once every member has ended.
        let slot = groups
            .iter_mut()
            .find(|(_, _, busy_until)| *busy_until <= allocation.lifetime.start);
        match slot {
            Some((members, size, busy_until)) => {
                members.push(allocation.id);
                *size = (*size).max(allocation.size);
                *busy_until = allocation.lifetime.end;
            }
            None => groups.push((
                vec![allocation.id],
                allocation.size,
                allocation.lifetime.end,
            )),
        }
    }

    groups
        .into_iter()
        .map(|(members, size, _)| (members, size))
        .collect()
}

fn build_layout(
    affinity: MemoryManagerAffinity,
    allocations: &[ManagedAllocation],
    alignment: usize,
) -> PoolLayout {
    let sizes: BTreeMap<AllocationId, usize> =
        allocations.iter().map(|a| (a.id, a.size)).collect();
    let mut layout = PoolLayout {
        affinity,
        ..PoolLayout::default()
    };

    let mut cursor = 0;
    for (group_idx, (members, size)) in assign_groups(allocations).into_iter().enumerate() {
        let (buffer, offset) = match affinity {
            MemoryManagerAffinity::Buffer => {
                layout.buffer_sizes.push(size);
                (group_idx, 0)
            }
            MemoryManagerAffinity::Offset => {
                let offset = align_up(cursor, alignment);
                cursor = offset + size;
                (0, offset)
            }
        };
        for id in &members {
            let region = Region {
                buffer,
                offset,
                size: sizes.get(id).copied().unwrap_or(0),
            };
            layout.regions.insert(*id, (group_idx, region));
        }
        layout.groups.push(LifetimeGroup {
            members,
            size,
            buffer,
            offset,
        });
    }

    if affinity == MemoryManagerAffinity::Offset && !layout.groups.is_empty() {
        layout.buffer_sizes.push(align_up(cursor, alignment));
    }

    layout
}

/// Whole-buffer reuse: every group owns one buffer.
#[derive(Debug, Default)]
pub struct BlobLifetimeManager {
    allocations: Vec<ManagedAllocation>,
}

impl BlobLifetimeManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LifetimeManager for BlobLifetimeManager {
    fn affinity(&self) -> MemoryManagerAffinity {
        MemoryManagerAffinity::Buffer
    }

    fn register(&mut self, allocation: ManagedAllocation) -> Status {
        validate_registration(&self.allocations, &allocation)?;
        self.allocations.push(allocation);
        Ok(())
    }

    fn allocations(&self) -> &[ManagedAllocation] {
        &self.allocations
    }

    fn remove(&mut self, id: AllocationId) -> bool {
        let before = self.allocations.len();
        self.allocations.retain(|a| a.id != id);
        self.allocations.len() != before
    }

    fn clear(&mut self) {
        self.allocations.clear();
    }

    fn compute_layout(&self, alignment: usize) -> PoolLayout {
        build_layout(MemoryManagerAffinity::Buffer, &self.allocations, alignment)
    }
}

/// Sub-region reuse: all groups packed into one buffer.
#[derive(Debug, Default)]
pub struct OffsetLifetimeManager {
    allocations: Vec<ManagedAllocation>,
}

impl OffsetLifetimeManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LifetimeManager for OffsetLifetimeManager {
    fn affinity(&self) -> MemoryManagerAffinity {
        MemoryManagerAffinity::Offset
    }

    fn register(&mut self, allocation: ManagedAllocation) -> Status {
        validate_registration(&self.allocations, &allocation)?;
        self.allocations.push(allocation);
        Ok(())
    }

    fn allocations(&self) -> &[ManagedAllocation] {
        &self.allocations
    }

    fn remove(&mut self, id: AllocationId) -> bool {
        let before = self.allocations.len();
        self.allocations.retain(|a| a.id != id);
        self.allocations.len() != before
    }

    fn clear(&mut self) {
        self.allocations.clear();
    }

    fn compute_layout(&self, alignment: usize) -> PoolLayout {
        build_layout(MemoryManagerAffinity::Offset, &self.allocations, alignment)
    }
}

/// Create the lifetime manager matching an affinity.
pub fn lifetime_manager_for(affinity: MemoryManagerAffinity) -> Box<dyn LifetimeManager> {
    match affinity {
        MemoryManagerAffinity::Buffer => Box::new(BlobLifetimeManager::new()),
        MemoryManagerAffinity::Offset => Box::new(OffsetLifetimeManager::new()),
    }
}
