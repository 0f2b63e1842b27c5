//! Handle arena for zero-copy buffers.
//!
//! Every backing is allocated once and referenced by a stable
//! [`BufferHandle`] for as long as it is live. Steady-state generation never
//! allocates: the same handles are handed to the models on every step, and
//! only a phase-transition resize releases or adds slots.

use std::sync::Arc;

use crate::error::CoreError;
use crate::{DType, Result, Shape, TensorAllocator, ZeroCopyTensor};

/// Stable index of a buffer inside a [`BufferArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(usize);

/// Owns every zero-copy backing of one generation call.
///
/// Released slots are never reused, so a stale handle fails loudly instead of
/// silently resolving to a different buffer.
pub struct BufferArena {
    slots: Vec<Option<ZeroCopyTensor>>,
    allocator: Arc<dyn TensorAllocator>,
    live_bytes: usize,
    peak_bytes: usize,
}

impl BufferArena {
    /// Create an arena that allocates through `allocator`.
    pub fn new(allocator: Arc<dyn TensorAllocator>) -> Self {
        Self {
            slots: Vec::new(),
            allocator,
            live_bytes: 0,
            peak_bytes: 0,
        }
    }

    /// Allocate a fresh zero-filled backing.
    pub fn alloc(&mut self, dtype: DType, shape: &Shape) -> Result<BufferHandle> {
        let tensor = self.allocator.allocate(dtype, shape)?;
        if tensor.dtype() != dtype || tensor.shape() != shape {
            return Err(CoreError::Allocation {
                dtype,
                shape: shape.clone(),
                reason: format!(
                    "allocator returned {} {}",
                    tensor.dtype(),
                    tensor.shape()
                ),
            });
        }
        Ok(self.adopt(tensor))
    }

    /// Allocate a backing and fill it from f32 values.
    pub fn alloc_from_f32(&mut self, dtype: DType, shape: &Shape, values: &[f32]) -> Result<BufferHandle> {
        let handle = self.alloc(dtype, shape)?;
        self.get(handle)?.write_f32(values)?;
        Ok(handle)
    }

    /// Take ownership of an existing backing without copying it.
    pub fn adopt(&mut self, tensor: ZeroCopyTensor) -> BufferHandle {
        self.live_bytes += tensor.nbytes();
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        self.slots.push(Some(tensor));
        BufferHandle(self.slots.len() - 1)
    }

    /// Resolve a handle to its backing.
    pub fn get(&self, handle: BufferHandle) -> Result<&ZeroCopyTensor> {
        self.slots
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(CoreError::StaleHandle(handle.0))
    }

    /// Release a slot. The backing itself lives on while other handles
    /// (e.g. an in-flight task) still reference it.
    pub fn release(&mut self, handle: BufferHandle) -> Option<ZeroCopyTensor> {
        let tensor = self.slots.get_mut(handle.0)?.take()?;
        self.live_bytes = self.live_bytes.saturating_sub(tensor.nbytes());
        Some(tensor)
    }

    /// Bytes held by live slots.
    pub fn used_bytes(&self) -> usize {
        self.live_bytes
    }

    /// High-water mark of `used_bytes`.
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostAllocator;

    fn host_arena() -> BufferArena {
        BufferArena::new(Arc::new(HostAllocator))
    }

    #[test]
    fn test_basic_alloc() {
        let mut arena = host_arena();
        let h = arena.alloc(DType::F16, &Shape::new(&[1, 64])).unwrap();
        assert_eq!(arena.get(h).unwrap().numel(), 64);
        assert_eq!(arena.used_bytes(), 128);
    }

    #[test]
    fn test_handles_are_stable() {
        let mut arena = host_arena();
        let a = arena.alloc(DType::F32, &Shape::new(&[4])).unwrap();
        let id = arena.get(a).unwrap().id();
        for _ in 0..10 {
            arena.alloc(DType::F32, &Shape::new(&[4])).unwrap();
        }
        assert_eq!(arena.get(a).unwrap().id(), id);
    }

    #[test]
    fn test_release_and_stale_handle() {
        let mut arena = host_arena();
        let a = arena.alloc(DType::F32, &Shape::new(&[4])).unwrap();
        let b = arena.alloc(DType::F32, &Shape::new(&[8])).unwrap();
        assert_eq!(arena.used_bytes(), 48);
        assert!(arena.release(a).is_some());
        assert!(arena.release(a).is_none());
        assert!(matches!(arena.get(a), Err(CoreError::StaleHandle(0))));
        assert_eq!(arena.used_bytes(), 32);
        assert_eq!(arena.peak_bytes(), 48);
        assert!(arena.get(b).is_ok());
    }

    #[test]
    fn test_adopt_keeps_identity() {
        let mut arena = host_arena();
        let t = ZeroCopyTensor::zeros(DType::F16, [2, 2]);
        let h = arena.adopt(t.clone());
        assert!(arena.get(h).unwrap().same_backing(&t));
    }

    #[test]
    fn test_released_backing_outlives_slot() {
        let mut arena = host_arena();
        let h = arena.alloc_from_f32(DType::F32, &Shape::new(&[2]), &[1.0, 2.0]).unwrap();
        let held = arena.get(h).unwrap().clone();
        arena.release(h);
        assert_eq!(held.to_f32_vec(), vec![1.0, 2.0]);
        assert!(arena.get(h).is_err());
    }

    struct WrongShapeAllocator;

    impl TensorAllocator for WrongShapeAllocator {
        fn allocate(&self, dtype: DType, _shape: &Shape) -> Result<ZeroCopyTensor> {
            Ok(ZeroCopyTensor::zeros(dtype, [1]))
        }
    }

    #[test]
    fn test_rejects_misbehaving_allocator() {
        let mut arena = BufferArena::new(Arc::new(WrongShapeAllocator));
        let err = arena.alloc(DType::F16, &Shape::new(&[4])).unwrap_err();
        assert!(matches!(err, CoreError::Allocation { .. }));
    }
}
