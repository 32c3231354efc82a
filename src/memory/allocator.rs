//! Backing-buffer allocation.
//!
//! Backends are handed a ready [`Allocator`] at construction. The memory
//! manager and dedicated tensor handles are the only callers; operators never
//! allocate pooled storage themselves.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{GraphError, GraphResult};

/// Host-visible backing storage.
///
/// Stored as 32-bit words so F32 views never need realignment; the logical
/// byte length may be smaller than the word capacity.
#[derive(Clone, PartialEq)]
pub struct Buffer {
    words: Vec<f32>,
    bytes: usize,
}

impl Buffer {
    pub fn zeroed(bytes: usize) -> Self {
        Self {
            words: vec![0.0; bytes.div_ceil(4)],
            bytes,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn as_f32(&self) -> &[f32] {
        &self.words
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        &mut self.words
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.bytes]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let bytes = self.bytes;
        &mut bytemuck::cast_slice_mut(&mut self.words)[..bytes]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("bytes", &self.bytes).finish()
    }
}

/// Allocator handed to a backend by device bring-up code.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate `bytes` of zeroed storage. `alignment` must be a power of two.
    fn allocate(&self, bytes: usize, alignment: usize) -> GraphResult<Buffer>;

    /// Statistics about allocations made so far
    fn stats(&self) -> AllocatorStats;
}

/// Host memory allocator with optional capacity limit.
///
/// Also stands in as the device allocator for GPU targets when the device
/// exposes host-visible memory.
#[derive(Debug)]
pub struct HostAllocator {
    name: String,
    capacity: Option<usize>,
    total_allocated: AtomicUsize,
    allocation_count: AtomicUsize,
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::named("host")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            total_allocated: AtomicUsize::new(0),
            allocation_count: AtomicUsize::new(0),
        }
    }

    /// Fail allocations once `capacity` bytes have been handed out.
    pub fn with_capacity_limit(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Allocator for HostAllocator {
    fn allocate(&self, bytes: usize, alignment: usize) -> GraphResult<Buffer> {
        if !alignment.is_power_of_two() {
            return Err(GraphError::AllocationFailed(format!(
                "Alignment must be power of 2, got {}",
                alignment
            )));
        }

        if let Some(capacity) = self.capacity {
            let used = self.total_allocated.load(Ordering::Relaxed);
            if used.saturating_add(bytes) > capacity {
                return Err(GraphError::AllocationFailed(format!(
                    "{}: need {} bytes, {} of {} already allocated",
                    self.name, bytes, used, capacity
                )));
            }
        }

        self.total_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("{} allocated {} bytes (alignment={})", self.name, bytes, alignment);

        Ok(Buffer::zeroed(bytes))
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about allocator usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    /// Total bytes handed out
    pub total_allocated: usize,
    /// Number of allocate calls that succeeded
    pub allocation_count: usize,
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocatorStats: allocated={}KB in {} buffers",
            self.total_allocated / 1024,
            self.allocation_count
        )
    }
}

/// Align offset up to alignment
///
/// Alignment must be a power of 2.
pub fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}
