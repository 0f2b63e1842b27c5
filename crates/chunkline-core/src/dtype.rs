use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types a chunk model may declare on its inputs and outputs.
///
/// Accelerator-resident activations and caches are half precision; token ids
/// and sequence counters are 32-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 32-bit signed integer
    I32,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
            DType::I32 => write!(f, "i32"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::F16.element_size(), 2);
        assert_eq!(DType::F32.element_size(), 4);
        assert_eq!(DType::I32.element_size(), 4);
        assert_eq!(DType::F16.storage_bytes(10), 20);
    }

    #[test]
    fn test_dtype_categories() {
        assert!(DType::F16.is_float());
        assert!(DType::F32.is_float());
        assert!(!DType::I32.is_float());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", DType::F16), "f16");
        assert_eq!(format!("{}", DType::I32), "i32");
    }
}
