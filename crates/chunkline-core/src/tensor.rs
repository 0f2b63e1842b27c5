//! Zero-copy tensors: shared, identity-carrying backings that a model can
//! read as an input and write into as an output.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use half::f16;
use parking_lot::RwLock;

use crate::error::CoreError;
use crate::{DType, Result, Shape};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one allocated backing.
///
/// Every allocation receives a fresh id; clones of a [`ZeroCopyTensor`]
/// share it. Aliasing checks compare ids, never contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
enum TensorData {
    F16(Vec<f16>),
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::F16 => TensorData::F16(vec![f16::ZERO; n]),
            DType::F32 => TensorData::F32(vec![0.0; n]),
            DType::I32 => TensorData::I32(vec![0; n]),
        }
    }

    fn to_f32(&self) -> Vec<f32> {
        match self {
            TensorData::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TensorData::F32(v) => v.clone(),
            TensorData::I32(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }
}

/// A shaped tensor whose storage is shared by every clone.
///
/// Cloning is cheap (an `Arc` bump) and never copies data: a clone handed to
/// a model as an output backing is written in place, and the writer's result
/// is visible through every other clone. This is the host-side stand-in for
/// accelerator-visible memory; real backends provide their own
/// [`TensorAllocator`].
#[derive(Clone)]
pub struct ZeroCopyTensor {
    id: BufferId,
    dtype: DType,
    shape: Shape,
    data: Arc<RwLock<TensorData>>,
}

impl ZeroCopyTensor {
    /// Allocate a zero-filled tensor with a fresh identity.
    pub fn zeros(dtype: DType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let data = TensorData::zeros(dtype, shape.numel());
        Self {
            id: BufferId::next(),
            dtype,
            shape,
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Create a float tensor from f32 values, converting to `dtype`.
    pub fn from_f32(dtype: DType, shape: impl Into<Shape>, values: &[f32]) -> Result<Self> {
        let tensor = Self::zeros(dtype, shape);
        tensor.write_f32(values)?;
        Ok(tensor)
    }

    /// Create an i32 tensor (token ids, counters).
    pub fn from_i32(shape: impl Into<Shape>, values: &[i32]) -> Result<Self> {
        let tensor = Self::zeros(DType::I32, shape);
        tensor.write_i32(values)?;
        Ok(tensor)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Size of the backing in bytes.
    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel())
    }

    /// Whether `other` refers to the same backing.
    pub fn same_backing(&self, other: &ZeroCopyTensor) -> bool {
        self.id == other.id
    }

    /// Read the whole tensor as f32 values.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.read().to_f32()
    }

    /// Read an i32 tensor.
    pub fn to_i32_vec(&self) -> Result<Vec<i32>> {
        match &*self.data.read() {
            TensorData::I32(v) => Ok(v.clone()),
            _ => Err(CoreError::DTypeMismatch {
                expected: DType::I32,
                got: self.dtype,
            }),
        }
    }

    /// Read one row along the trailing axis, as f32.
    ///
    /// Row `r` covers elements `r * last_dim .. (r + 1) * last_dim`.
    pub fn row_f32(&self, row: usize) -> Result<Vec<f32>> {
        let width = self.shape.last_dim().unwrap_or(1);
        let rows = self.shape.outer_size();
        if row >= rows {
            return Err(CoreError::ElementCount {
                shape: self.shape.clone(),
                expected: rows,
                got: row + 1,
            });
        }
        let start = row * width;
        let data = self.data.read();
        let values = match &*data {
            TensorData::F16(v) => v[start..start + width].iter().map(|x| x.to_f32()).collect(),
            TensorData::F32(v) => v[start..start + width].to_vec(),
            TensorData::I32(v) => v[start..start + width].iter().map(|&x| x as f32).collect(),
        };
        Ok(values)
    }

    /// Overwrite the backing in place from f32 values.
    pub fn write_f32(&self, values: &[f32]) -> Result<()> {
        self.check_len(values.len())?;
        match &mut *self.data.write() {
            TensorData::F16(v) => {
                for (dst, &src) in v.iter_mut().zip(values) {
                    *dst = f16::from_f32(src);
                }
            }
            TensorData::F32(v) => v.copy_from_slice(values),
            TensorData::I32(_) => {
                return Err(CoreError::DTypeMismatch {
                    expected: DType::F32,
                    got: self.dtype,
                })
            }
        }
        Ok(())
    }

    /// Overwrite an i32 backing in place.
    pub fn write_i32(&self, values: &[i32]) -> Result<()> {
        self.check_len(values.len())?;
        match &mut *self.data.write() {
            TensorData::I32(v) => {
                v.copy_from_slice(values);
                Ok(())
            }
            _ => Err(CoreError::DTypeMismatch {
                expected: DType::I32,
                got: self.dtype,
            }),
        }
    }

    fn check_len(&self, got: usize) -> Result<()> {
        let expected = self.numel();
        if got != expected {
            return Err(CoreError::ElementCount {
                shape: self.shape.clone(),
                expected,
                got,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ZeroCopyTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeroCopyTensor")
            .field("id", &self.id)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .finish()
    }
}

/// Concatenate `head` with the first `tail_len` positions of `tail` along
/// the trailing (sequence) axis and keep the last `len` positions of every
/// row. Rows shorter than `len` are left-padded with zeros.
///
/// Returns row-major values for a tensor of shape `head.shape()` with the
/// trailing dimension replaced by `len`.
pub fn sequence_suffix(
    head: &ZeroCopyTensor,
    tail: &ZeroCopyTensor,
    tail_len: usize,
    len: usize,
) -> Result<Vec<f32>> {
    if !head.shape().matches_except_last(tail.shape()) {
        return Err(CoreError::SequenceAxis {
            first: head.id(),
            first_shape: head.shape().clone(),
            second: tail.id(),
            second_shape: tail.shape().clone(),
        });
    }
    let head_width = head.shape().last_dim().unwrap_or(1);
    let tail_width = tail.shape().last_dim().unwrap_or(1);
    let tail_len = tail_len.min(tail_width);
    let rows = head.shape().outer_size();

    let head_data = head.to_f32_vec();
    let tail_data = if head.same_backing(tail) {
        head_data.clone()
    } else {
        tail.to_f32_vec()
    };

    let mut out = vec![0.0f32; rows * len];
    let mut joined = Vec::with_capacity(head_width + tail_len);
    for r in 0..rows {
        joined.clear();
        joined.extend_from_slice(&head_data[r * head_width..(r + 1) * head_width]);
        joined.extend_from_slice(&tail_data[r * tail_width..r * tail_width + tail_len]);

        let take = joined.len().min(len);
        let src = &joined[joined.len() - take..];
        let dst_start = r * len + (len - take);
        out[dst_start..dst_start + take].copy_from_slice(src);
    }
    Ok(out)
}

/// The opaque "allocate a zero-copy tensor of shape S" primitive.
///
/// Backends that own accelerator-visible memory implement this; the host
/// implementation hands out heap-backed tensors.
pub trait TensorAllocator: Send + Sync {
    fn allocate(&self, dtype: DType, shape: &Shape) -> Result<ZeroCopyTensor>;
}

/// Heap-backed allocator used on the host and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl TensorAllocator for HostAllocator {
    fn allocate(&self, dtype: DType, shape: &Shape) -> Result<ZeroCopyTensor> {
        Ok(ZeroCopyTensor::zeros(dtype, shape.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_and_identity() {
        let a = ZeroCopyTensor::zeros(DType::F16, [1, 4]);
        let b = ZeroCopyTensor::zeros(DType::F16, [1, 4]);
        assert_eq!(a.nbytes(), 8);
        assert!(!a.same_backing(&b));
        let a2 = a.clone();
        assert!(a.same_backing(&a2));
    }

    #[test]
    fn test_write_through_clone() {
        let a = ZeroCopyTensor::zeros(DType::F32, [2, 2]);
        let alias = a.clone();
        alias.write_f32(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(a.to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_f16_roundtrip_integers() {
        let t = ZeroCopyTensor::from_f32(DType::F16, [3], &[1.0, 511.0, -2.0]).unwrap();
        assert_eq!(t.to_f32_vec(), vec![1.0, 511.0, -2.0]);
    }

    #[test]
    fn test_length_and_dtype_checks() {
        let t = ZeroCopyTensor::zeros(DType::F16, [4]);
        assert!(t.write_f32(&[1.0]).is_err());
        assert!(t.write_i32(&[1, 2, 3, 4]).is_err());
        assert!(t.to_i32_vec().is_err());

        let ids = ZeroCopyTensor::from_i32([1, 3], &[7, 8, 9]).unwrap();
        assert_eq!(ids.to_i32_vec().unwrap(), vec![7, 8, 9]);
        assert!(ids.write_f32(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_row_access() {
        let t = ZeroCopyTensor::from_f32(DType::F32, [1, 2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(t.row_f32(1).unwrap(), vec![3.0, 4.0, 5.0]);
        assert!(t.row_f32(2).is_err());
    }

    #[test]
    fn test_sequence_suffix_slides_window() {
        // Two rows, cache of 3 positions, 2 new positions.
        let head = ZeroCopyTensor::from_f32(DType::F32, [1, 2, 1, 3], &[1.0, 2.0, 3.0, 10.0, 20.0, 30.0]).unwrap();
        let tail = ZeroCopyTensor::from_f32(DType::F32, [1, 2, 1, 2], &[4.0, 5.0, 40.0, 50.0]).unwrap();
        let out = sequence_suffix(&head, &tail, 2, 3).unwrap();
        assert_eq!(out, vec![3.0, 4.0, 5.0, 30.0, 40.0, 50.0]);
    }

    #[test]
    fn test_sequence_suffix_partial_tail_and_padding() {
        let head = ZeroCopyTensor::from_f32(DType::F32, [1, 1, 1, 2], &[1.0, 2.0]).unwrap();
        let tail = ZeroCopyTensor::from_f32(DType::F32, [1, 1, 1, 4], &[3.0, 9.0, 9.0, 9.0]).unwrap();
        // Only one real position in the tail; target wider than what exists.
        let out = sequence_suffix(&head, &tail, 1, 5).unwrap();
        assert_eq!(out, vec![0.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_sequence_suffix_rejects_mismatched_rows() {
        let head = ZeroCopyTensor::zeros(DType::F32, [1, 2, 1, 3]);
        let tail = ZeroCopyTensor::zeros(DType::F32, [1, 4, 1, 3]);
        assert!(sequence_suffix(&head, &tail, 3, 3).is_err());
    }

    #[test]
    fn test_host_allocator() {
        let t = HostAllocator.allocate(DType::F16, &Shape::new(&[1, 8])).unwrap();
        assert_eq!(t.shape().dims(), &[1, 8]);
        assert!(t.to_f32_vec().iter().all(|&v| v == 0.0));
    }
}
